//! Bounded-retry condition polling
//!
//! Every readiness, deletion and fault-activation check in the harness goes
//! through [`poll_until`]. Conditions report transient failures through
//! [`ConditionError::retryable`], so the poller never needs to know what a
//! "not found yet" looks like for a given resource.

mod cancel;
mod poller;

pub use cancel::CancelToken;
pub use poller::{poll_until, ConditionError, Evaluation, PollError, PollPolicy};
