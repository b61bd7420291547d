// CarbonBatch Infrastructure - SQLite Adapter
// Implements: BatchStore, Maintenance

mod batch_store;
mod connection;
mod error;
mod maintenance_impl;
mod migration;

pub use batch_store::SqliteBatchStore;
pub use connection::create_pool;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::run_migrations;
