//! Barrier synchronization for parallel branches.
//!
//! A [`BarrierRegistry`] holds named barriers. Participants arrive with a
//! stable id; the barrier releases when the expected number of distinct
//! participants has arrived, or fails for everyone on abort or timeout.

mod registry;
mod state;

pub use registry::BarrierRegistry;
pub use state::{BarrierOutcome, BarrierSnapshot, BarrierState};
