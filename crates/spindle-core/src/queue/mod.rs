//! Queue module: retry scheduling and wake-up signalling.

mod retry;
mod signal;

pub use retry::{DEFAULT_BACKOFF_MS, RetryPolicy};
pub use signal::{WakeReceiver, WakeResult, WakeSender, wake_channel};
