//! HTTP adapters for the two remote backends: the primary REST API and the
//! optional row-based secondary store.

pub mod api;
pub mod secondary;

pub use api::HttpRemoteApi;
pub use secondary::{HttpSecondaryStore, SecondaryConfig};
