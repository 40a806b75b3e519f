pub mod memory;
pub mod table;

pub use memory::{MemoryDb, MemoryStats, MemoryTransaction};
pub use table::{Table, TableSchema};
