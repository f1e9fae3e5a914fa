//! 共享音频通道：单槽读写协议
//!
//! 生产者（生成器进程）调用 [`SharedAudioChannel::write`]，
//! 消费者（插件音频回调）调用 [`SharedAudioChannel::read`]。
//!
//! 同步机制：
//! - 跨进程：各字段原子 + 先写 payload、最后以 Release 写 `data_ready`
//! - 进程内：一把本地 Mutex，只防止同一进程的多个线程交错访问，
//!   不提供任何跨进程互斥
//!
//! 背压：槽内还有未读数据时 `write` 直接失败，绝不覆盖。

use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, TryLockError};

use super::layout::{
    ChannelRecord, CHANNEL_CAPACITY, DEFAULT_FREQUENCY, DEFAULT_SAMPLE_RATE, RECORD_SIZE,
};
use super::segment::{SegmentError, SharedSegment};
use crate::audio::timing;

/// 一次成功读取的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOutcome {
    /// 实际写入每个输出声道的样本数
    pub frames: usize,
    /// 估计延迟（毫秒）。对端时钟异常时可能为负
    pub latency_ms: f32,
}

/// 共享音频通道
///
/// 可以处于未连接状态：此时所有读写失败，元数据返回默认值，
/// 消费者永远不会解引用一个不存在的记录。
pub struct SharedAudioChannel {
    segment: Option<SharedSegment>,
    /// 进程内锁（不跨进程）
    lock: Mutex<()>,
}

impl SharedAudioChannel {
    /// 连接到命名共享内存（不存在则创建）
    pub fn connect(name: &str) -> Result<Self, SegmentError> {
        let segment = SharedSegment::acquire(name, RECORD_SIZE)?;
        Self::from_segment(segment)
    }

    /// 连接失败时返回未连接的通道（降级为静音 / no-op）
    pub fn open_or_detached(name: &str) -> Self {
        match Self::connect(name) {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("Shared memory unavailable, running without transport: {}", e);
                Self::detached()
            }
        }
    }

    /// 进程内匿名通道
    pub fn anonymous() -> Result<Self, SegmentError> {
        Self::from_segment(SharedSegment::anonymous(RECORD_SIZE)?)
    }

    /// 在已有的段上建立通道
    pub fn from_segment(segment: SharedSegment) -> Result<Self, SegmentError> {
        if segment.size() < RECORD_SIZE {
            return Err(SegmentError::SizeMismatch {
                name: segment.name().unwrap_or("<anonymous>").to_string(),
                expected: RECORD_SIZE,
                actual: segment.size(),
            });
        }
        debug_assert_eq!(
            segment.as_ptr() as usize % std::mem::align_of::<ChannelRecord>(),
            0
        );

        Ok(Self {
            segment: Some(segment),
            lock: Mutex::new(()),
        })
    }

    /// 未连接的通道
    pub fn detached() -> Self {
        Self {
            segment: None,
            lock: Mutex::new(()),
        }
    }

    /// 是否已连接
    pub fn is_attached(&self) -> bool {
        self.segment.is_some()
    }

    /// 底层共享内存段
    pub fn segment(&self) -> Option<&SharedSegment> {
        self.segment.as_ref()
    }

    #[inline]
    fn record(&self) -> Option<&ChannelRecord> {
        // SAFETY: 段大小在构造时已检查 >= RECORD_SIZE，mmap 返回页对齐地址，
        // 全零字节对所有原子字段都是合法值；映射与 self 同生命周期。
        self.segment
            .as_ref()
            .map(|s| unsafe { &*(s.as_ptr() as *const ChannelRecord) })
    }

    #[inline]
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 写入一个块（生产者调用）
    ///
    /// 上一个块还没读完时失败，调用方应稍后重试。
    /// 超过容量的部分被截断；空块被拒绝（否则会出现 data_ready 为真而 buffer_size 为 0）。
    pub fn write(&self, samples: &[f32]) -> bool {
        let Some(record) = self.record() else {
            return false;
        };
        if samples.is_empty() {
            return false;
        }

        let _guard = self.guard();

        if record.data_ready.load(Ordering::Acquire) {
            return false;
        }

        let count = samples.len().min(CHANNEL_CAPACITY);

        record.original_sample_rate.store(
            record.sample_rate.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );

        for (slot, &sample) in record.samples[..count].iter().zip(samples) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }

        record.timestamp.store(timing::now_us(), Ordering::Relaxed);
        record.write_position.store(0, Ordering::Relaxed);
        record.buffer_size.store(count as i32, Ordering::Relaxed);
        record.read_position.store(0, Ordering::Relaxed);

        // 发布：所有 payload 和簿记字段都必须在此之前写完
        record.data_ready.store(true, Ordering::Release);

        true
    }

    /// 读取最多 `frames` 个样本到每个输出声道（消费者调用，实时安全）
    ///
    /// 单声道源广播到所有声道。没有数据时立即返回 None，绝不等待；
    /// 本进程内锁被占用时也视为未命中。
    pub fn read(&self, outputs: &mut [&mut [f32]], frames: usize) -> Option<ReadOutcome> {
        let record = self.record()?;

        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };

        if !record.data_ready.load(Ordering::Acquire) {
            return None;
        }

        let buffer_size = record.buffer_size.load(Ordering::Relaxed);
        if buffer_size <= 0 {
            return None;
        }
        let available = (buffer_size as usize).min(CHANNEL_CAPACITY);

        let latency_ms = timing::elapsed_ms(
            record.timestamp.load(Ordering::Relaxed),
            timing::now_us(),
        );

        let frames = outputs
            .iter()
            .map(|ch| ch.len())
            .fold(frames, usize::min);
        let to_read = frames.min(available);

        let read_pos = (record.read_position.load(Ordering::Relaxed).max(0) as usize)
            % CHANNEL_CAPACITY;

        for channel in outputs.iter_mut() {
            for (i, out) in channel[..to_read].iter_mut().enumerate() {
                let idx = (read_pos + i) % CHANNEL_CAPACITY;
                *out = f32::from_bits(record.samples[idx].load(Ordering::Relaxed));
            }
        }

        record.read_position.store(
            ((read_pos + to_read) % CHANNEL_CAPACITY) as i32,
            Ordering::Relaxed,
        );

        if to_read >= available {
            // 整块读完：把槽交还给生产者
            record.data_ready.store(false, Ordering::Release);
        } else {
            record
                .buffer_size
                .store((available - to_read) as i32, Ordering::Release);
        }

        Some(ReadOutcome {
            frames: to_read,
            latency_ms,
        })
    }

    /// 槽内是否有未读块
    pub fn has_pending_block(&self) -> bool {
        self.record()
            .map(|r| r.data_ready.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 槽内剩余未读样本数
    pub fn pending_samples(&self) -> usize {
        match self.record() {
            Some(r) if r.data_ready.load(Ordering::Acquire) => {
                r.buffer_size.load(Ordering::Relaxed).max(0) as usize
            }
            _ => 0,
        }
    }

    /// 消费者请求的采样率
    pub fn sample_rate(&self) -> f64 {
        self.record()
            .map(|r| f64::from_bits(r.sample_rate.load(Ordering::Acquire)))
            .unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn set_sample_rate(&self, rate: f64) {
        if let Some(record) = self.record() {
            let _guard = self.guard();
            record.sample_rate.store(rate.to_bits(), Ordering::Release);
        }
    }

    /// 生产者最近一次写入时看到的采样率
    pub fn original_sample_rate(&self) -> f64 {
        self.record()
            .map(|r| f64::from_bits(r.original_sample_rate.load(Ordering::Acquire)))
            .unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// 生产者频率
    pub fn frequency(&self) -> f32 {
        self.record()
            .map(|r| f32::from_bits(r.frequency.load(Ordering::Acquire)))
            .unwrap_or(DEFAULT_FREQUENCY)
    }

    pub fn set_frequency(&self, frequency: f32) {
        if let Some(record) = self.record() {
            let _guard = self.guard();
            record.frequency.store(frequency.to_bits(), Ordering::Release);
        }
    }

    /// 生产者是否存活
    pub fn generator_active(&self) -> bool {
        self.record()
            .map(|r| r.generator_active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_generator_active(&self, active: bool) {
        if let Some(record) = self.record() {
            let _guard = self.guard();
            record.generator_active.store(active, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for SharedAudioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAudioChannel")
            .field("segment", &self.segment)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 * 0.001).collect()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let data = ramp(512);

        assert!(channel.write(&data));

        let mut out = vec![0.0f32; 512];
        let outcome = channel.read(&mut [&mut out[..]], 512).unwrap();
        assert_eq!(outcome.frames, 512);
        assert_eq!(out, data);
        assert!(!channel.has_pending_block());
    }

    #[test]
    fn test_mono_fans_out_to_every_channel() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let data = ramp(64);
        assert!(channel.write(&data));

        let mut left = vec![0.0f32; 64];
        let mut right = vec![0.0f32; 64];
        channel.read(&mut [&mut left[..], &mut right[..]], 64).unwrap();
        assert_eq!(left, data);
        assert_eq!(right, data);
    }

    #[test]
    fn test_backpressure() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        assert!(channel.write(&ramp(128)));
        // 未读完之前不能覆盖
        assert!(!channel.write(&[9.0; 128]));

        let mut out = vec![0.0f32; 128];
        channel.read(&mut [&mut out[..]], 128).unwrap();
        assert_eq!(out, ramp(128));

        // 读完后立即可写
        assert!(channel.write(&[9.0; 128]));
    }

    #[test]
    fn test_read_empty_returns_none() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let mut out = vec![1.0f32; 32];
        assert!(channel.read(&mut [&mut out[..]], 32).is_none());
        // 未命中时不动输出
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_partial_drain() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let data = ramp(300);
        assert!(channel.write(&data));

        let mut first = vec![0.0f32; 200];
        let outcome = channel.read(&mut [&mut first[..]], 200).unwrap();
        assert_eq!(outcome.frames, 200);
        assert_eq!(&first[..], &data[..200]);
        assert!(channel.has_pending_block());
        assert_eq!(channel.pending_samples(), 100);
        assert!(!channel.write(&data));

        let mut second = vec![0.0f32; 200];
        let outcome = channel.read(&mut [&mut second[..]], 200).unwrap();
        assert_eq!(outcome.frames, 100);
        assert_eq!(&second[..100], &data[200..]);
        assert!(!channel.has_pending_block());
    }

    #[test]
    fn test_write_clamps_to_capacity() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let data = vec![0.25f32; CHANNEL_CAPACITY + 100];
        assert!(channel.write(&data));
        assert_eq!(channel.pending_samples(), CHANNEL_CAPACITY);
    }

    #[test]
    fn test_full_capacity_block_round_trip() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        let data: Vec<f32> = (0..CHANNEL_CAPACITY + 100)
            .map(|i| (i as f32 * 0.001).sin())
            .collect();
        assert!(channel.write(&data));

        let mut out = vec![0.0f32; CHANNEL_CAPACITY];
        let read = channel.read(&mut [&mut out[..]], CHANNEL_CAPACITY).unwrap();
        assert_eq!(read.frames, CHANNEL_CAPACITY);
        assert_eq!(&out[..], &data[..CHANNEL_CAPACITY]);
        assert!(!channel.has_pending_block());
    }

    #[test]
    fn test_empty_write_rejected() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        assert!(!channel.write(&[]));
        assert!(!channel.has_pending_block());
    }

    #[test]
    fn test_latency_tracks_wall_clock() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        assert!(channel.write(&ramp(16)));
        std::thread::sleep(Duration::from_millis(20));

        let mut out = vec![0.0f32; 16];
        let outcome = channel.read(&mut [&mut out[..]], 16).unwrap();
        assert!(outcome.latency_ms >= 0.0);
        assert!(
            outcome.latency_ms >= 18.0 && outcome.latency_ms < 500.0,
            "latency {} ms",
            outcome.latency_ms
        );
    }

    #[test]
    fn test_write_records_original_sample_rate() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        channel.set_sample_rate(48000.0);
        assert!(channel.write(&ramp(8)));
        assert_eq!(channel.original_sample_rate(), 48000.0);
    }

    #[test]
    fn test_detached_defaults() {
        let channel = SharedAudioChannel::detached();
        assert!(!channel.is_attached());
        assert_eq!(channel.sample_rate(), 44100.0);
        assert_eq!(channel.frequency(), 440.0);
        assert!(!channel.generator_active());

        channel.set_generator_active(true);
        assert!(!channel.generator_active());
        assert!(!channel.write(&ramp(8)));

        let mut out = vec![0.0f32; 8];
        assert!(channel.read(&mut [&mut out[..]], 8).is_none());
    }

    #[test]
    fn test_metadata_round_trip() {
        let channel = SharedAudioChannel::anonymous().unwrap();
        // 新建段全零
        assert_eq!(channel.sample_rate(), 0.0);
        assert!(!channel.generator_active());

        channel.set_sample_rate(96000.0);
        channel.set_frequency(1234.5);
        channel.set_generator_active(true);
        assert_eq!(channel.sample_rate(), 96000.0);
        assert_eq!(channel.frequency(), 1234.5);
        assert!(channel.generator_active());
    }

    #[test]
    fn test_two_handles_share_one_segment() {
        let name = format!("shmb-chan-{}", std::process::id());
        let producer = SharedAudioChannel::connect(&name).unwrap();
        let consumer = SharedAudioChannel::connect(&name).unwrap();
        assert!(producer.segment().unwrap().is_owner());
        assert!(!consumer.segment().unwrap().is_owner());

        consumer.set_sample_rate(48000.0);
        assert_eq!(producer.sample_rate(), 48000.0);

        let data = ramp(256);
        assert!(producer.write(&data));
        assert!(!producer.write(&data));

        let mut out = vec![0.0f32; 256];
        consumer.read(&mut [&mut out[..]], 256).unwrap();
        assert_eq!(out, data);
        assert!(producer.write(&data));
    }
}
