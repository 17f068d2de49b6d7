pub mod cache;
pub mod compose;
pub mod extract;
pub mod retry;

pub use cache::ResolutionCache;
pub use compose::{compose, ReplyLine};
pub use retry::{with_retry, RetryPolicy};
