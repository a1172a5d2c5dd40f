//! Loader metrics.
//!
//! Events implement the shared `InternalEvent` trait from `snowdrift-core`
//! and are emitted with `snowdrift_core::emit!`.

pub mod events;

pub use events::*;
