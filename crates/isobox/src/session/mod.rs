//! Session metadata persistence.
//!
//! One directory per session under the sessions root, holding a single
//! `metadata.json` record keyed by container name.

mod error;
mod models;
mod store;

pub use error::{StoreError, StoreResult};
pub use models::Session;
pub use store::{METADATA_FILE, SessionStore};
