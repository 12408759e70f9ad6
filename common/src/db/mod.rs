// Database layer module
// PostgreSQL connection pool backing the audit log

pub mod pool;

pub use pool::DbPool;
