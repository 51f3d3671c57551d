//! Task persistence — repository trait and backends.

mod libsql_backend;
mod memory;
mod migrations;
mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::TaskStore;
