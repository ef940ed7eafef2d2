// Canonical definitions live here; the crate root re-exports the public
// surface.
pub mod backoff;
pub mod config;
pub mod frame;
pub mod heartbeat;
pub mod types;

pub use frame::*;
pub use types::*;
