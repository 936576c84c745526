//! Concrete physical sources

pub mod file;
pub mod memory;
pub mod nested;
pub mod relational;

pub use file::{CsvRowStream, FileSource};
pub use memory::MemorySource;
pub use nested::NestedSource;
pub use relational::RelationalSource;
