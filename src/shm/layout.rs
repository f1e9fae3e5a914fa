//! 共享内存中的记录布局
//!
//! 两个进程直接把映射区域解释为 [`ChannelRecord`]，因此布局必须逐字节一致：
//! - `#[repr(C)]` 固定字段顺序
//! - 所有字段都是原子类型，全零字节即合法初始值
//! - 浮点数以 bit pattern 存放在同宽度的原子整数里
//!
//! 字段顺序固定，按同一 C 布局实现的其他进程也可以直接互通。
//! 不做版本协商：布局不匹配即未定义行为。

use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64};

/// 样本槽容量（单声道样本数）
pub const CHANNEL_CAPACITY: usize = 16384;

/// 默认的共享内存名称
pub const DEFAULT_SEGMENT_NAME: &str = "LowLatencyAudioPluginSharedMemory";

/// 未连接时 sample_rate 的默认值
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// 未连接时 frequency 的默认值
pub const DEFAULT_FREQUENCY: f32 = 440.0;

/// 共享内存段大小
pub const RECORD_SIZE: usize = size_of::<ChannelRecord>();

/// 共享音频通道记录
///
/// 单槽 mailbox：最多只有一个未读块。
/// 各字段独立原子，整条记录不保证事务一致性；
/// 读端只依赖 "先写 payload、最后写 data_ready" 这一发布顺序。
#[repr(C)]
pub struct ChannelRecord {
    /// 读位置（消费者推进，生产者每次写入时归零）
    pub read_position: AtomicI32,
    /// 写位置（单槽设计下恒为 0）
    pub write_position: AtomicI32,
    /// 槽内是否有未读样本
    pub data_ready: AtomicBool,
    /// 槽内剩余未读样本数
    pub buffer_size: AtomicI32,
    /// 消费者请求的采样率（f64 bits）
    pub sample_rate: AtomicU64,
    /// 生产者最近一次写入时使用的采样率（f64 bits）
    pub original_sample_rate: AtomicU64,
    /// 写入时刻（单调时钟，微秒）
    pub timestamp: AtomicU64,
    /// 生产者当前频率（f32 bits），供显示
    pub frequency: AtomicU32,
    /// 生产者存活标志
    pub generator_active: AtomicBool,
    /// 样本槽（f32 bits）
    pub samples: [AtomicU32; CHANNEL_CAPACITY],
}

// 布局检查：header 48 字节 + 样本区
const _: () = assert!(size_of::<ChannelRecord>() == 48 + CHANNEL_CAPACITY * 4);
const _: () = assert!(align_of::<ChannelRecord>() == 8);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_field_offsets() {
        assert_eq!(offset_of!(ChannelRecord, read_position), 0);
        assert_eq!(offset_of!(ChannelRecord, write_position), 4);
        assert_eq!(offset_of!(ChannelRecord, data_ready), 8);
        assert_eq!(offset_of!(ChannelRecord, buffer_size), 12);
        assert_eq!(offset_of!(ChannelRecord, sample_rate), 16);
        assert_eq!(offset_of!(ChannelRecord, original_sample_rate), 24);
        assert_eq!(offset_of!(ChannelRecord, timestamp), 32);
        assert_eq!(offset_of!(ChannelRecord, frequency), 40);
        assert_eq!(offset_of!(ChannelRecord, generator_active), 44);
        assert_eq!(offset_of!(ChannelRecord, samples), 48);
    }

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_SIZE, 65584);
    }
}
