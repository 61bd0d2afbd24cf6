//! Cooperative cancellation.
//!
//! The same token type carries worker-loop shutdown requests and the
//! "lease lost" signal a heartbeat raises for the handler it guards.

mod token;

pub use token::CancellationToken;
