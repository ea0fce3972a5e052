pub mod crdt;
pub mod database;
pub mod files;
pub mod migrations;
pub mod models;
pub mod sites;

mod error;

pub use crdt::{CrdtStore, QueryResult, SubscriptionId};
pub use database::Database;
pub use error::{Result, StoreError};
pub use files::FileStore;
pub use models::*;
