//! Core domain and synchronization logic for the Tallybook finance tracker.
//!
//! This crate holds everything that does not touch the network or the disk
//! directly: the entity model, the identifier reconciler, the durable
//! mutation queue, and the sync orchestrator. Storage and remote backends
//! are injected behind the traits in [`store`] and [`sync::remote`].

pub mod errors;
pub mod model;
pub mod store;
pub mod sync;

pub use errors::{Error, Result};
