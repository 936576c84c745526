//! Engine-neutral vocabulary for the source-adapter layer:
//! values, logical/physical schemas, predicates and errors.

pub mod error;
pub mod predicate;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use predicate::{Operator, Predicates, Qualifier};
pub use types::{LogicalColumn, LogicalType, PhysicalColumn, Value};
