//! The workflow automation engine.
//!
//! Control flow: event source → trigger matcher → condition evaluator →
//! action executor → connectors (rate-limited) → execution log. The
//! dispatcher is the single entry point for both webhook deliveries and
//! schedule ticks.

pub mod actions;
pub mod conditions;
pub mod context;
pub mod dispatch;
pub mod executor;
pub mod locks;
pub mod matcher;
pub mod rate_limiter;

pub use dispatch::Dispatcher;
pub use executor::Executor;
pub use locks::LockArena;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
