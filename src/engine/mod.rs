//! 生成器引擎（生产者）
//!
//! 在独立线程上按块生成音频（正弦或文件），写入共享通道：
//! - 目标采样率由消费者写入通道的 sample_rate 决定
//! - 通道满（上一块未读完）时指数退避重试，不忙等
//! - 按块时长的一定比例节拍，既不断流也不淹没单槽
//!
//! 状态机：Stopped → Running → Stopped，每次切换都把 generator_active 写进通道

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use thiserror::Error;

use crate::decode::{self, AudioInfo, DecodeError};
use crate::shm::layout::DEFAULT_SAMPLE_RATE;
use crate::shm::{SharedAudioChannel, CHANNEL_CAPACITY};
use crate::source::{DecodedSource, FilePlayer, SineOscillator};

/// 允许的频率范围（开区间）
pub const MIN_FREQUENCY: f32 = 0.0;
pub const MAX_FREQUENCY: f32 = 20000.0;

/// 两次写入之间的最长间隔
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// 生成器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Stopped,
    Running,
}

/// 生成模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorMode {
    Sine,
    File,
}

/// 写入重试策略
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 第 n 次失败后睡眠 `unit * 2^n`
    pub unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            unit: Duration::from_millis(1),
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt` 次失败后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(1u32 << attempt.min(16))
    }
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    /// 每块样本数
    pub block_size: usize,
    /// 两次写入之间的目标间隔占块时长的比例
    /// 0.5 = 半块余量，保证消费者读完前下一块已经在路上
    pub refresh_ratio: f64,
    /// 初始频率
    pub frequency: f32,
    /// 写入重试
    pub backoff: BackoffPolicy,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            refresh_ratio: 0.5,
            frequency: 440.0,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl GeneratorConfig {
    /// 检查块长和节拍比例
    ///
    /// 块长必须在 1..=CHANNEL_CAPACITY 内，比例必须是 (0, 1] 内的有限值
    pub fn validate(&self) -> Result<(), GeneratorError> {
        if self.block_size == 0 || self.block_size > CHANNEL_CAPACITY {
            return Err(GeneratorError::InvalidConfig(format!(
                "block size {} must be between 1 and {}",
                self.block_size, CHANNEL_CAPACITY
            )));
        }
        if !self.refresh_ratio.is_finite() || self.refresh_ratio <= 0.0 || self.refresh_ratio > 1.0
        {
            return Err(GeneratorError::InvalidConfig(format!(
                "refresh ratio {} must be in (0, 1]",
                self.refresh_ratio
            )));
        }
        Ok(())
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid frequency {0} Hz (must be between 0 and 20000 Hz)")]
    InvalidFrequency(f32),

    #[error("invalid generator config: {0}")]
    InvalidConfig(String),

    #[error("no audio file loaded")]
    NoFileLoaded,

    #[error("failed to load audio file: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to spawn generator thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// 生成器统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// 成功写入的块数
    pub blocks_written: u64,
    /// 重试用尽后丢弃的块数
    pub blocks_dropped: u64,
    /// 写入失败后重试的次数
    pub write_retries: u64,
}

/// 控制线程和生成线程之间的共享状态
struct ProducerShared {
    running: AtomicBool,
    frequency: AtomicCell<f32>,
    mode: AtomicCell<GeneratorMode>,
    /// 文件播放器（只在加载文件和生成块时加锁，不在实时路径上）
    file: Mutex<Option<FilePlayer>>,
    blocks_written: AtomicU64,
    blocks_dropped: AtomicU64,
    write_retries: AtomicU64,
}

impl ProducerShared {
    fn file(&self) -> MutexGuard<'_, Option<FilePlayer>> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 生成器
pub struct Generator {
    config: GeneratorConfig,
    channel: Arc<SharedAudioChannel>,
    state: GeneratorState,
    shared: Arc<ProducerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Generator {
    /// 创建生成器，初始频率立即发布到通道
    pub fn new(channel: Arc<SharedAudioChannel>, config: GeneratorConfig) -> Self {
        let frequency = if is_valid_frequency(config.frequency) {
            config.frequency
        } else {
            log::warn!(
                "Configured frequency {} Hz out of range, using 440 Hz",
                config.frequency
            );
            440.0
        };

        channel.set_frequency(frequency);
        channel.set_generator_active(false);

        let shared = Arc::new(ProducerShared {
            running: AtomicBool::new(false),
            frequency: AtomicCell::new(frequency),
            mode: AtomicCell::new(GeneratorMode::Sine),
            file: Mutex::new(None),
            blocks_written: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
        });

        Self {
            config,
            channel,
            state: GeneratorState::Stopped,
            shared,
            thread: None,
        }
    }

    /// 启动生成线程
    pub fn start(&mut self) -> Result<(), GeneratorError> {
        if self.is_running() {
            return Ok(());
        }
        // 线程异常退出后留下的句柄
        self.stop();
        self.config.validate()?;

        self.shared.running.store(true, Ordering::Release);
        self.channel.set_generator_active(true);

        let shared = Arc::clone(&self.shared);
        let channel = Arc::clone(&self.channel);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("generator".to_string())
            .spawn(move || Self::generator_thread_main(shared, channel, config));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.state = GeneratorState::Running;
                log::info!("Generator started ({:?} mode)", self.mode());
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.channel.set_generator_active(false);
                Err(GeneratorError::Spawn(e))
            }
        }
    }

    /// 停止生成线程
    ///
    /// 先标记 inactive 让消费者立即察觉，再等待线程退出；
    /// 返回后不会再有任何写入
    pub fn stop(&mut self) {
        if self.state == GeneratorState::Stopped {
            return;
        }

        self.shared.running.store(false, Ordering::Release);
        self.channel.set_generator_active(false);

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Generator thread panicked");
            }
        }

        self.state = GeneratorState::Stopped;
        log::info!("Generator stopped");
    }

    /// 当前状态；生成线程异常退出后报告 Stopped
    pub fn state(&self) -> GeneratorState {
        if self.state == GeneratorState::Running && self.shared.running.load(Ordering::Acquire) {
            GeneratorState::Running
        } else {
            GeneratorState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == GeneratorState::Running
    }

    /// 设置频率（0 < hz < 20000），非法值不改变任何状态
    pub fn set_frequency(&self, frequency: f32) -> Result<(), GeneratorError> {
        if !is_valid_frequency(frequency) {
            return Err(GeneratorError::InvalidFrequency(frequency));
        }

        self.shared.frequency.store(frequency);
        self.channel.set_frequency(frequency);
        log::info!("Frequency set to {} Hz", frequency);
        Ok(())
    }

    pub fn frequency(&self) -> f32 {
        self.shared.frequency.load()
    }

    /// 加载音频文件（整文件解码进内存）
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<AudioInfo, GeneratorError> {
        let (source, info) = decode::load_file(path)?;
        self.load_source(Box::new(source));
        Ok(info)
    }

    /// 直接提供已解码的源
    pub fn load_source(&self, source: Box<dyn DecodedSource>) {
        log::info!(
            "Source loaded: {}Hz {}ch",
            source.source_sample_rate(),
            source.channels()
        );
        *self.shared.file() = Some(FilePlayer::new(source));
    }

    /// 切换生成模式；文件模式要求已加载文件
    pub fn switch_mode(&self, mode: GeneratorMode) -> Result<(), GeneratorError> {
        if mode == GeneratorMode::File {
            let mut file = self.shared.file();
            match file.as_mut() {
                Some(player) => player.rewind(),
                None => return Err(GeneratorError::NoFileLoaded),
            }
        }

        self.shared.mode.store(mode);
        log::info!("Switched to {:?} mode", mode);
        Ok(())
    }

    pub fn mode(&self) -> GeneratorMode {
        self.shared.mode.load()
    }

    /// 获取统计信息
    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            blocks_written: self.shared.blocks_written.load(Ordering::Relaxed),
            blocks_dropped: self.shared.blocks_dropped.load(Ordering::Relaxed),
            write_retries: self.shared.write_retries.load(Ordering::Relaxed),
        }
    }

    /// 生成线程主函数
    fn generator_thread_main(
        shared: Arc<ProducerShared>,
        channel: Arc<SharedAudioChannel>,
        config: GeneratorConfig,
    ) {
        let _active = ActiveGuard {
            shared: &shared,
            channel: &channel,
        };
        let mut oscillator = SineOscillator::new();
        let mut block = vec![0.0f32; config.block_size];
        let mut last_cycle = Instant::now();

        log::info!(
            "Generator thread started, block size {} samples",
            block.len()
        );

        while shared.running.load(Ordering::Acquire) {
            let sample_rate = target_sample_rate(&channel);
            let target_refresh =
                block_duration(block.len(), sample_rate).mul_f64(config.refresh_ratio);

            match shared.mode.load() {
                GeneratorMode::Sine => {
                    oscillator.render(&mut block, shared.frequency.load(), sample_rate)
                }
                GeneratorMode::File => match shared.file().as_mut() {
                    Some(player) => player.render(&mut block, sample_rate),
                    None => block.fill(0.0),
                },
            }

            let attempts = write_with_backoff(&channel, &block, &config.backoff, || {
                shared.running.load(Ordering::Acquire)
            });
            match attempts {
                WriteResult::Written { retries } => {
                    shared.blocks_written.fetch_add(1, Ordering::Relaxed);
                    shared
                        .write_retries
                        .fetch_add(retries as u64, Ordering::Relaxed);
                }
                WriteResult::GaveUp { retries } => {
                    shared.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                    shared
                        .write_retries
                        .fetch_add(retries as u64, Ordering::Relaxed);
                    log::debug!("Channel still full after {} retries, block dropped", retries);
                }
                WriteResult::Cancelled => break,
            }

            // 节拍：距离上一轮不足目标间隔就睡掉剩余部分
            let elapsed = last_cycle.elapsed();
            if elapsed < target_refresh {
                thread::sleep(target_refresh - elapsed);
            }
            last_cycle = Instant::now();
        }

        log::info!("Generator thread finished");
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.stop();
        self.channel.set_generator_active(false);
    }
}

/// 生成线程退出时（包括 panic 展开）撤下活跃标志
struct ActiveGuard<'a> {
    shared: &'a ProducerShared,
    channel: &'a SharedAudioChannel,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.channel.set_generator_active(false);
        if thread::panicking() {
            log::error!("Generator thread aborted, marked inactive");
        }
    }
}

/// 带退避的写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// 写入成功（之前失败了 `retries` 次）
    Written { retries: u32 },
    /// 尝试次数用尽
    GaveUp { retries: u32 },
    /// 等待期间收到停止请求
    Cancelled,
}

/// 写入一块，失败后按 `unit * 2^n` 睡眠重试
///
/// `keep_running` 在每次睡眠前检查，停止请求可以打断退避
pub fn write_with_backoff(
    channel: &SharedAudioChannel,
    block: &[f32],
    policy: &BackoffPolicy,
    keep_running: impl Fn() -> bool,
) -> WriteResult {
    // 没有传输时直接丢弃，不做退避
    if !channel.is_attached() {
        return WriteResult::GaveUp { retries: 0 };
    }

    let max_attempts = policy.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if channel.write(block) {
            return WriteResult::Written { retries: attempt };
        }
        if !keep_running() {
            return WriteResult::Cancelled;
        }
        if attempt + 1 < max_attempts {
            thread::sleep(policy.delay(attempt));
        }
    }

    WriteResult::GaveUp {
        retries: max_attempts,
    }
}

/// 消费者声明的采样率，非正时回退到 44100
pub fn target_sample_rate(channel: &SharedAudioChannel) -> f64 {
    let rate = channel.sample_rate();
    if rate > 0.0 && rate.is_finite() {
        rate
    } else {
        DEFAULT_SAMPLE_RATE
    }
}

/// 一块在给定采样率下的时长，上限 [`MAX_REFRESH_INTERVAL`]
pub fn block_duration(block_size: usize, sample_rate: f64) -> Duration {
    Duration::try_from_secs_f64(block_size as f64 / sample_rate)
        .map_or(MAX_REFRESH_INTERVAL, |d| d.min(MAX_REFRESH_INTERVAL))
}

fn is_valid_frequency(frequency: f32) -> bool {
    frequency.is_finite() && frequency > MIN_FREQUENCY && frequency < MAX_FREQUENCY
}
