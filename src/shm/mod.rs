//! 共享内存传输
//!
//! 包含：
//! - Segment: 命名共享内存的创建 / 连接 / 释放
//! - Layout: 两个进程共享的固定记录布局
//! - Channel: 单槽读写协议

pub mod channel;
pub mod layout;
pub mod segment;

pub use channel::{ReadOutcome, SharedAudioChannel};
pub use layout::{ChannelRecord, CHANNEL_CAPACITY, DEFAULT_SEGMENT_NAME, RECORD_SIZE};
pub use segment::{SegmentError, SharedSegment};
