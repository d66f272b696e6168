//! ChatRelay 并发原语
//!
//! - Limiter: 基于 Semaphore + FIFO 队列的有界并发准入，限制同时进行的模型调用数

pub mod limiter;

pub use limiter::{Limiter, LimiterError, LimiterStats, TaskHandle};

/// 默认同时进行的模型调用数
pub const DEFAULT_MAX_CONCURRENT_COMPLETIONS: usize = 2;
