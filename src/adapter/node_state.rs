use std::sync::Arc;
use std::time::SystemTime;

use qore_core::{LogicalColumn, PhysicalColumn};
use tracing::debug;

use crate::cache::CachedRows;
use crate::config::{MappingMode, SourceDefinition};

/// Where a logical column's values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnMapping {
    /// 0-based physical column index
    Mapped(usize),
    /// Not present in the physical source; always null
    Missing,
}

impl ColumnMapping {
    pub fn physical_index(self) -> Option<usize> {
        match self {
            ColumnMapping::Mapped(index) => Some(index),
            ColumnMapping::Missing => None,
        }
    }
}

/// One immutable generation of an adapter's view of its source
///
/// Mapping, physical schema and cache are published together; a reader
/// holding an `Arc<NodeState>` never sees parts of two generations.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub generation: u64,
    pub logical: Arc<[LogicalColumn]>,
    pub physical: Arc<[PhysicalColumn]>,
    /// One entry per logical column
    pub mapping: Arc<[ColumnMapping]>,
    /// Modification stamp of the backing resource when this generation was built
    pub resource_stamp: Option<SystemTime>,
    pub cache: Option<Arc<CachedRows>>,
}

impl NodeState {
    pub fn new(
        generation: u64,
        logical: Vec<LogicalColumn>,
        physical: Vec<PhysicalColumn>,
        mapping: Vec<ColumnMapping>,
        resource_stamp: Option<SystemTime>,
    ) -> Self {
        debug_assert_eq!(logical.len(), mapping.len());
        Self {
            generation,
            logical: logical.into(),
            physical: physical.into(),
            mapping: mapping.into(),
            resource_stamp,
            cache: None,
        }
    }

    /// State before the first successful reinitialisation: no physical columns, all missing.
    pub fn uninitialised(logical: Vec<LogicalColumn>) -> Self {
        let mapping = vec![ColumnMapping::Missing; logical.len()];
        Self::new(0, logical, Vec::new(), mapping, None)
    }

    pub fn is_initialised(&self) -> bool {
        self.generation > 0
    }

    /// Next generation carrying `cache`, everything else shared.
    pub fn with_cache(&self, cache: Option<Arc<CachedRows>>) -> Self {
        Self {
            generation: self.generation + 1,
            cache,
            ..self.clone()
        }
    }

    /// Whether `other` reads the same physical columns the same way.
    pub fn same_layout(&self, other: &NodeState) -> bool {
        self.mapping == other.mapping
            && self.physical.len() == other.physical.len()
            && self
                .physical
                .iter()
                .zip(other.physical.iter())
                .all(|(a, b)| a.name == b.name && a.data_type == b.data_type)
    }

    /// Physical indexes read by at least one logical column, ascending.
    pub fn mapped_physical_columns(&self) -> Vec<usize> {
        let mut columns: Vec<usize> = self
            .mapping
            .iter()
            .filter_map(|m| m.physical_index())
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }
}

/// Maps each logical column of `definition` onto `physical`.
///
/// Priority: an override (empty target marks the column missing), then
/// position when the definition maps by position, then a case-insensitive
/// name match. Anything unresolved is [`ColumnMapping::Missing`].
pub fn resolve_mapping(
    definition: &SourceDefinition,
    physical: &[PhysicalColumn],
) -> Vec<ColumnMapping> {
    let by_name = |name: &str| {
        physical
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
            .map(ColumnMapping::Mapped)
            .unwrap_or(ColumnMapping::Missing)
    };

    definition
        .columns
        .iter()
        .enumerate()
        .map(|(position, column)| {
            let over = definition
                .column_overrides
                .iter()
                .find(|(logical, _)| logical.eq_ignore_ascii_case(column.name.as_str()))
                .map(|(_, target)| target.trim());

            let mapping = match (over, definition.mapping_mode) {
                (Some(""), _) => ColumnMapping::Missing,
                (Some(target), _) => by_name(target),
                (None, MappingMode::ByPosition) if position < physical.len() => {
                    ColumnMapping::Mapped(position)
                }
                (None, MappingMode::ByPosition) => ColumnMapping::Missing,
                (None, MappingMode::ByName) => by_name(column.name.as_str()),
            };
            if mapping == ColumnMapping::Missing {
                debug!(
                    source = %definition.id,
                    column = %column.name,
                    "Logical column has no physical counterpart"
                );
            }
            mapping
        })
        .collect()
}
