//! Rate limiting algorithms, their state, and the limiter tying them to storage.

mod algorithm;
mod backend;
mod clock;
mod fixed_window;
mod limiter;
mod metrics;
mod sliding_counter;
mod sliding_log;
mod state;
mod token_bucket;

pub use algorithm::{Algorithm, Outcome, RateLimitAlgorithm};
pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::FixedWindow;
pub use limiter::Limiter;
pub use metrics::{DecisionCounters, DecisionRecorder, NoopRecorder};
pub use sliding_counter::SlidingWindowCounter;
pub use sliding_log::SlidingWindowLog;
pub use state::{FixedWindowParams, SlidingCounterParams, SlidingLogParams, State, TokenBucketParams};
pub use token_bucket::TokenBucket;
