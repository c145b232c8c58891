pub mod config;
pub mod error;
pub mod error_utils;
pub mod retry;
pub mod rules;
pub mod types;

pub use error::*;
pub use error_utils::*;
pub use retry::{RetryConfig, RetryExecutor};
pub use rules::{matches, MatchRule, TextField};
pub use types::*;
