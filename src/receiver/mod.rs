//! 接收端（消费者）
//!
//! 宿主音频线程每个 callback 调用一次 [`StreamReceiver::process`]：
//! - 不分配内存，不做无界阻塞，不写日志
//! - 没有新数据时，按策略重放上一块或输出静音
//! - 生产者不活跃时永远偏向静音，不循环旧数据
//!
//! UI 线程只通过 [`DisplayState`] 的原子量读取显示值。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::audio::stats::ReceiverStats;
use crate::audio::timing;
use crate::shm::SharedAudioChannel;

/// 持久化状态长度：f32 延迟（LE）+ 播放标志
pub const STATE_LEN: usize = 5;

/// 未调用 prepare 时重放缓冲区的默认容量
pub const DEFAULT_MAX_BLOCK_FRAMES: usize = 4096;
pub const DEFAULT_OUTPUT_CHANNELS: usize = 2;

/// 读不到新数据时的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// 生产者仍活跃时重放上一块，避免短暂卡顿造成的断音
    #[default]
    RepeatLastBlock,
    /// 直接静音
    Silence,
}

/// 接收端配置
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// 生产者不活跃且超过这个时间没有新数据，判定超时
    pub timeout: Duration,
    /// 延迟测量的上限（毫秒），超出视为时钟异常
    pub max_plausible_latency_ms: f32,
    /// 显示频率的滞回阈值（Hz）
    pub frequency_epsilon: f32,
    pub stall_policy: StallPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_plausible_latency_ms: 1000.0,
            frequency_epsilon: 0.1,
            stall_policy: StallPolicy::RepeatLastBlock,
        }
    }
}

/// 一次 callback 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// 未播放或生产者不活跃，输出静音
    Inactive,
    /// 生产者不活跃且超时，输出静音
    TimedOut,
    /// 读到新数据
    Fresh,
    /// 未读到数据，重放了上一块
    Replayed,
    /// 未读到数据，输出静音
    Silent,
}

/// 状态恢复错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state blob too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// UI 可见的显示状态
///
/// 音频线程写，UI 线程读，全部是原子量
#[derive(Debug)]
pub struct DisplayState {
    latency_ms: CachePadded<AtomicCell<f32>>,
    frequency: CachePadded<AtomicCell<f32>>,
    playing: AtomicBool,
    valid_data: AtomicBool,
    timeout_detected: AtomicBool,
}

impl DisplayState {
    fn new(frequency: f32) -> Self {
        Self {
            latency_ms: CachePadded::new(AtomicCell::new(0.0)),
            frequency: CachePadded::new(AtomicCell::new(frequency)),
            playing: AtomicBool::new(false),
            valid_data: AtomicBool::new(false),
            timeout_detected: AtomicBool::new(false),
        }
    }

    pub fn toggle_playback(&self) {
        self.playing.fetch_xor(true, Ordering::AcqRel);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// 最近一次可信的延迟（毫秒）
    pub fn current_latency_ms(&self) -> f32 {
        self.latency_ms.load()
    }

    pub fn current_frequency(&self) -> f32 {
        self.frequency.load()
    }

    pub fn timeout_detected(&self) -> bool {
        self.timeout_detected.load(Ordering::Acquire)
    }

    pub fn has_valid_data(&self) -> bool {
        self.valid_data.load(Ordering::Acquire)
    }

    /// 序列化为 5 字节：延迟 f32 LE + 播放标志
    pub fn save_state(&self) -> [u8; STATE_LEN] {
        let mut out = [0u8; STATE_LEN];
        out[..4].copy_from_slice(&self.current_latency_ms().to_le_bytes());
        out[4] = self.is_playing() as u8;
        out
    }

    /// 从 [`save_state`](Self::save_state) 的输出恢复；多余字节忽略
    pub fn restore_state(&self, data: &[u8]) -> Result<(), StateError> {
        if data.len() < STATE_LEN {
            return Err(StateError::TooShort {
                expected: STATE_LEN,
                actual: data.len(),
            });
        }

        let latency = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.latency_ms.store(latency);
        self.set_playing(data[4] != 0);
        Ok(())
    }
}

/// 流接收端
pub struct StreamReceiver {
    channel: Arc<SharedAudioChannel>,
    config: ReceiverConfig,
    display: Arc<DisplayState>,
    stats: Arc<ReceiverStats>,
    /// 上一块成功读取后的完整输出（每声道一段）
    last_good: Vec<Vec<f32>>,
    last_good_frames: usize,
    /// 上一次成功读取的时间（微秒）
    last_data_us: u64,
}

impl StreamReceiver {
    pub fn new(channel: Arc<SharedAudioChannel>, config: ReceiverConfig) -> Self {
        let display = Arc::new(DisplayState::new(channel.frequency()));
        Self {
            channel,
            config,
            display,
            stats: Arc::new(ReceiverStats::new()),
            last_good: vec![vec![0.0; DEFAULT_MAX_BLOCK_FRAMES]; DEFAULT_OUTPUT_CHANNELS],
            last_good_frames: 0,
            last_data_us: timing::now_us(),
        }
    }

    /// 音频图准备时调用（可能分配内存，不在实时线程上）
    ///
    /// 发布宿主采样率，预分配重放缓冲区，重置计时器和超时标志
    pub fn prepare(&mut self, sample_rate: f64, max_block_frames: usize, channels: usize) {
        self.channel.set_sample_rate(sample_rate);

        self.last_good = vec![vec![0.0; max_block_frames]; channels];
        self.last_good_frames = 0;
        self.display.valid_data.store(false, Ordering::Release);

        self.last_data_us = timing::now_us();
        self.display.frequency.store(self.channel.frequency());
        self.display.timeout_detected.store(false, Ordering::Release);

        log::info!(
            "Receiver prepared: {}Hz, {} frames, {}ch",
            sample_rate,
            max_block_frames,
            channels
        );
    }

    /// 音频图释放时调用：停止播放
    pub fn release(&mut self) {
        self.display.set_playing(false);
    }

    /// 每个 callback 调用一次（实时安全）
    ///
    /// `outputs` 每个元素是一个声道；块长取所有声道的最短长度
    pub fn process(&mut self, outputs: &mut [&mut [f32]]) -> BlockOutcome {
        self.stats.on_callback();
        let (outcome, frames) = self.process_block(outputs);
        self.stats.record_outcome(outcome, frames);
        outcome
    }

    fn process_block(&mut self, outputs: &mut [&mut [f32]]) -> (BlockOutcome, usize) {
        let Self {
            channel,
            config,
            display,
            stats,
            last_good,
            last_good_frames,
            last_data_us,
        } = self;

        let block = outputs.iter().map(|ch| ch.len()).min().unwrap_or(0);
        let now_us = timing::now_us();
        let since_data_ms = timing::elapsed_ms(*last_data_us, now_us);
        let timed_out = since_data_ms > config.timeout.as_secs_f32() * 1000.0;

        // 1. 未播放或生产者不活跃
        if !display.is_playing() || !channel.generator_active() {
            clear(outputs);
            display.valid_data.store(false, Ordering::Release);
            if display.is_playing() && timed_out {
                display.timeout_detected.store(true, Ordering::Release);
                return (BlockOutcome::TimedOut, 0);
            }
            return (BlockOutcome::Inactive, 0);
        }

        // 2. 超时且不活跃（读完活跃标志后生产者可能刚好停止）
        if timed_out && !channel.generator_active() {
            display.timeout_detected.store(true, Ordering::Release);
            clear(outputs);
            display.valid_data.store(false, Ordering::Release);
            return (BlockOutcome::TimedOut, 0);
        }

        // 3. 读取
        if let Some(read) = channel.read(outputs, block) {
            if read.latency_ms > 0.0 && read.latency_ms < config.max_plausible_latency_ms {
                display.latency_ms.store(read.latency_ms);
                stats.record_latency(read.latency_ms);
            }

            let frequency = channel.frequency();
            if (frequency - display.frequency.load()).abs() > config.frequency_epsilon {
                display.frequency.store(frequency);
            }

            for ch in outputs.iter_mut() {
                ch[read.frames..].fill(0.0);
            }
            *last_good_frames = snapshot(last_good, outputs, block);
            if *last_good_frames == 0 && block > 0 {
                stats.record_snapshot_overflow();
            }

            *last_data_us = now_us;
            display.valid_data.store(true, Ordering::Release);
            display.timeout_detected.store(false, Ordering::Release);
            return (BlockOutcome::Fresh, read.frames);
        }

        // 4. 未命中
        if !channel.generator_active() {
            clear(outputs);
            display.valid_data.store(false, Ordering::Release);
            return (BlockOutcome::Silent, 0);
        }

        if config.stall_policy == StallPolicy::RepeatLastBlock
            && display.has_valid_data()
            && *last_good_frames > 0
        {
            replay(last_good, *last_good_frames, outputs);
            return (BlockOutcome::Replayed, 0);
        }

        clear(outputs);
        (BlockOutcome::Silent, 0)
    }

    /// UI 线程持有的显示状态
    pub fn display(&self) -> Arc<DisplayState> {
        Arc::clone(&self.display)
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    pub fn toggle_playback(&self) {
        self.display.toggle_playback();
    }

    pub fn set_playing(&self, playing: bool) {
        self.display.set_playing(playing);
    }

    pub fn is_playing(&self) -> bool {
        self.display.is_playing()
    }

    pub fn current_latency_ms(&self) -> f32 {
        self.display.current_latency_ms()
    }

    pub fn current_frequency(&self) -> f32 {
        self.display.current_frequency()
    }

    /// 连接状态：通道标记活跃且没有检测到超时
    pub fn is_generator_active(&self) -> bool {
        self.channel.generator_active() && !self.display.timeout_detected()
    }

    pub fn timeout_detected(&self) -> bool {
        self.display.timeout_detected()
    }

    pub fn has_valid_data(&self) -> bool {
        self.display.has_valid_data()
    }

    pub fn save_state(&self) -> [u8; STATE_LEN] {
        self.display.save_state()
    }

    pub fn restore_state(&self, data: &[u8]) -> Result<(), StateError> {
        self.display.restore_state(data)
    }
}

fn clear(outputs: &mut [&mut [f32]]) {
    for channel in outputs.iter_mut() {
        channel.fill(0.0);
    }
}

/// 保存本次输出，返回可重放的帧数
///
/// 声道数或块长超出预分配容量时不截断，返回 0，该块不可重放
fn snapshot(last_good: &mut [Vec<f32>], outputs: &[&mut [f32]], block: usize) -> usize {
    if outputs.len() > last_good.len() || last_good.iter().any(|dst| dst.len() < block) {
        return 0;
    }
    for (dst, src) in last_good.iter_mut().zip(outputs.iter()) {
        dst[..block].copy_from_slice(&src[..block]);
    }
    block
}

fn replay(last_good: &[Vec<f32>], frames: usize, outputs: &mut [&mut [f32]]) {
    for (i, channel) in outputs.iter_mut().enumerate() {
        match last_good.get(i) {
            Some(saved) => {
                let n = frames.min(channel.len()).min(saved.len());
                channel[..n].copy_from_slice(&saved[..n]);
                channel[n..].fill(0.0);
            }
            None => channel.fill(0.0),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;

    fn setup(config: ReceiverConfig) -> (Arc<SharedAudioChannel>, StreamReceiver) {
        let channel = Arc::new(SharedAudioChannel::anonymous().unwrap());
        let mut receiver = StreamReceiver::new(Arc::clone(&channel), config);
        receiver.prepare(48000.0, 64, 2);
        receiver.set_playing(true);
        (channel, receiver)
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 / n as f32).collect()
    }

    #[test]
    fn test_prepare_publishes_sample_rate() {
        let (channel, receiver) = setup(ReceiverConfig::default());
        assert_eq!(channel.sample_rate(), 48000.0);
        assert!(!receiver.timeout_detected());
        assert!(!receiver.has_valid_data());
    }

    #[test]
    fn test_not_playing_is_silent() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        receiver.set_playing(false);
        channel.set_generator_active(true);
        channel.write(&ramp(64));

        let (mut l, mut r) = ([1.0f32; 64], [1.0f32; 64]);
        let outcome = receiver.process(&mut [&mut l[..], &mut r[..]]);
        assert_eq!(outcome, BlockOutcome::Inactive);
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));
        // 数据没有被消费
        assert!(channel.has_pending_block());
    }

    #[test]
    fn test_fresh_read_fans_out_to_both_channels() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);
        let block = ramp(64);
        channel.write(&block);

        let (mut l, mut r) = ([0.0f32; 64], [0.0f32; 64]);
        let outcome = receiver.process(&mut [&mut l[..], &mut r[..]]);
        assert_eq!(outcome, BlockOutcome::Fresh);
        assert_eq!(&l[..], &block[..]);
        assert_eq!(&r[..], &block[..]);
        assert!(receiver.has_valid_data());
        assert_eq!(receiver.stats().samples_delivered(), 64);
    }

    #[test]
    fn test_short_block_tail_is_silenced() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);
        channel.write(&[0.5; 40]);

        let mut out = [9.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Fresh);
        assert!(out[..40].iter().all(|&s| s == 0.5));
        assert!(out[40..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stall_with_active_generator_replays_bit_for_bit() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);
        channel.write(&ramp(64));

        let (mut l, mut r) = ([0.0f32; 64], [0.0f32; 64]);
        receiver.process(&mut [&mut l[..], &mut r[..]]);
        let (first_l, first_r) = (l, r);

        let (mut l2, mut r2) = ([7.0f32; 64], [7.0f32; 64]);
        let outcome = receiver.process(&mut [&mut l2[..], &mut r2[..]]);
        assert_eq!(outcome, BlockOutcome::Replayed);
        for i in 0..64 {
            assert_eq!(l2[i].to_bits(), first_l[i].to_bits());
            assert_eq!(r2[i].to_bits(), first_r[i].to_bits());
        }
    }

    #[test]
    fn test_block_larger_than_prepared_is_not_replayed() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);
        channel.write(&ramp(128));

        // 宿主发来超过 prepare 声明的块长
        let (mut l, mut r) = ([0.0f32; 128], [0.0f32; 128]);
        assert_eq!(
            receiver.process(&mut [&mut l[..], &mut r[..]]),
            BlockOutcome::Fresh
        );
        assert_eq!(&l[..], &ramp(128)[..]);
        assert_eq!(receiver.stats().snapshot_overflow_count(), 1);

        // 不重放截断的块
        let (mut l, mut r) = ([7.0f32; 128], [7.0f32; 128]);
        assert_eq!(
            receiver.process(&mut [&mut l[..], &mut r[..]]),
            BlockOutcome::Silent
        );
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));

        // 回到正常块长后恢复重放
        channel.write(&ramp(64));
        let mut out = [0.0f32; 64];
        receiver.process(&mut [&mut out[..]]);
        let mut again = [7.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut again[..]]), BlockOutcome::Replayed);
        assert_eq!(again, out);
    }

    #[test]
    fn test_unprepared_receiver_replays_with_default_capacity() {
        let channel = Arc::new(SharedAudioChannel::anonymous().unwrap());
        let mut receiver = StreamReceiver::new(Arc::clone(&channel), ReceiverConfig::default());
        receiver.set_playing(true);
        channel.set_generator_active(true);
        channel.write(&ramp(512));

        let (mut l, mut r) = (vec![0.0f32; 512], vec![0.0f32; 512]);
        assert_eq!(
            receiver.process(&mut [&mut l[..], &mut r[..]]),
            BlockOutcome::Fresh
        );

        let (mut l2, mut r2) = (vec![7.0f32; 512], vec![7.0f32; 512]);
        assert_eq!(
            receiver.process(&mut [&mut l2[..], &mut r2[..]]),
            BlockOutcome::Replayed
        );
        assert_eq!(l2, l);
        assert_eq!(r2, r);
        assert_eq!(receiver.stats().snapshot_overflow_count(), 0);
    }

    #[test]
    fn test_silence_policy_disables_replay() {
        let config = ReceiverConfig {
            stall_policy: StallPolicy::Silence,
            ..Default::default()
        };
        let (channel, mut receiver) = setup(config);
        channel.set_generator_active(true);
        channel.write(&ramp(64));

        let mut out = [0.0f32; 64];
        receiver.process(&mut [&mut out[..]]);

        let mut out = [7.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Silent);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_no_history_miss_is_silent() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);

        let mut out = [3.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Silent);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_inactive_generator_drops_valid_data() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_generator_active(true);
        channel.write(&ramp(64));
        let mut out = [0.0f32; 64];
        receiver.process(&mut [&mut out[..]]);
        assert!(receiver.has_valid_data());

        channel.set_generator_active(false);
        let mut out = [5.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Inactive);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!receiver.has_valid_data());

        // 重新活跃后也不会重放旧块
        channel.set_generator_active(true);
        let mut out = [5.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Silent);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_timeout_yields_silence_not_replay() {
        let config = ReceiverConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (channel, mut receiver) = setup(config);
        channel.set_generator_active(true);
        channel.write(&ramp(64));
        let mut out = [0.0f32; 64];
        receiver.process(&mut [&mut out[..]]);

        channel.set_generator_active(false);
        thread::sleep(Duration::from_millis(40));

        let mut out = [5.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::TimedOut);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(receiver.timeout_detected());
        assert!(!receiver.is_generator_active());

        // 新数据到达清除超时
        channel.set_generator_active(true);
        channel.write(&ramp(64));
        let mut out = [0.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Fresh);
        assert!(!receiver.timeout_detected());
        assert!(receiver.is_generator_active());
    }

    #[test]
    fn test_long_gap_with_active_generator_is_not_timeout() {
        let config = ReceiverConfig {
            timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (channel, mut receiver) = setup(config);
        channel.set_generator_active(true);
        thread::sleep(Duration::from_millis(30));

        let mut out = [0.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Silent);
        assert!(!receiver.timeout_detected());
    }

    #[test]
    fn test_latency_filter_and_frequency_hysteresis() {
        let (channel, mut receiver) = setup(ReceiverConfig::default());
        channel.set_frequency(440.0);
        receiver.prepare(48000.0, 64, 2);
        channel.set_generator_active(true);
        assert_eq!(receiver.current_frequency(), 440.0);

        channel.set_frequency(440.05);
        thread::sleep(Duration::from_millis(2));
        channel.write(&ramp(64));
        thread::sleep(Duration::from_millis(5));
        let mut out = [0.0f32; 64];
        assert_eq!(receiver.process(&mut [&mut out[..]]), BlockOutcome::Fresh);

        // 抖动内的变化被忽略
        assert_eq!(receiver.current_frequency(), 440.0);
        let latency = receiver.current_latency_ms();
        assert!(latency > 0.0 && latency < 1000.0, "latency {}", latency);

        channel.set_frequency(880.0);
        channel.write(&ramp(64));
        receiver.process(&mut [&mut out[..]]);
        assert_eq!(receiver.current_frequency(), 880.0);
    }

    #[test]
    fn test_state_round_trip() {
        let (_channel, receiver) = setup(ReceiverConfig::default());
        receiver.display.latency_ms.store(12.5);
        let saved = receiver.save_state();
        assert_eq!(saved[4], 1);

        let (_other_channel, other) = setup(ReceiverConfig::default());
        other.set_playing(false);
        other.restore_state(&saved).unwrap();
        assert_eq!(other.current_latency_ms(), 12.5);
        assert!(other.is_playing());

        assert_eq!(
            other.restore_state(&saved[..3]),
            Err(StateError::TooShort {
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn test_toggle_playback() {
        let (_channel, receiver) = setup(ReceiverConfig::default());
        assert!(receiver.is_playing());
        receiver.toggle_playback();
        assert!(!receiver.is_playing());
        receiver.toggle_playback();
        assert!(receiver.is_playing());
    }
}
