//! Utility functions for time and id handling.
//!
//! Everything that reads "now" goes through a [`Clock`] so lease expiry and
//! visibility delays can be driven deterministically in tests.

mod clock;
mod ids;

pub use clock::{add_duration, far_future, Clock, ManualClock, SystemClock, Timestamp};
pub use ids::{generate_id, generate_lease_token, generate_message_id};
