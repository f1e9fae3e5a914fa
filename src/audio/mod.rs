//! 音频核心模块
//!
//! 包含：
//! - Timing: 跨进程单调时钟
//! - Stats: 接收统计

pub mod stats;
pub mod timing;

pub use stats::{ReceiverStats, StatsReport};
