pub mod models;
pub mod queries;

pub use models::{IpState, OneTimeToken};
pub use queries::{init_db, DbPool, IpStateRepo, TokenRepo};

#[cfg(test)]
pub use queries::setup_test_db;
