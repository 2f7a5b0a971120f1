//! Test-level retry decisions and interaction-level transient retries

pub mod policy;
pub mod transient;

pub use policy::{FlakyPolicy, RetryPolicy};
pub use transient::{retry_stale, retry_transient, InteractionError};
