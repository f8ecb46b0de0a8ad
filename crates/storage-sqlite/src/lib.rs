//! SQLite implementation of the local document store.

pub mod db;
pub mod store;

pub use store::SqliteLocalStore;
