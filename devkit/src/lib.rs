/*!
# Warden DevKit - harness and fixtures for recovery scenarios

- A [`TestHarness`] wiring a full engine over an in-memory fake fleet
- Node fixtures for each failure family the diagnoser knows
- Assertions on node status, audit records and remote mutations
*/

pub mod fixtures;
pub mod test_utils;

pub use test_utils::{HarnessStats, TestHarness};
pub use warden_kernel::testkit::{FakeFleet, FakeNode};
