//! 接收统计模块
//!
//! 在音频回调中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::timing::{now_ticks, ticks_to_ns};
use crate::receiver::BlockOutcome;

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const SAMPLE_BUFFER_SIZE: usize = 256;

/// 接收统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct ReceiverStats {
    callback_count: AtomicU64,
    last_sampled_ticks: AtomicU64,

    // 存储 interval（单位：ticks，后处理时转换）
    interval_buffer: Box<[AtomicU64; SAMPLE_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 延迟（f32 位模式，也降频采样）
    fresh_count: AtomicU64,
    latency_buffer: Box<[AtomicU32; SAMPLE_BUFFER_SIZE]>,
    latency_write_idx: AtomicUsize,

    replayed_count: AtomicU64,
    silent_count: AtomicU64,
    inactive_count: AtomicU64,
    timed_out_count: AtomicU64,
    // 新块超出重放缓冲区容量，快照作废的次数
    snapshot_overflow_count: AtomicU64,

    // 从通道读到的样本数（每声道）
    samples_delivered: AtomicU64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            last_sampled_ticks: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            fresh_count: AtomicU64::new(0),
            latency_buffer: Box::new(std::array::from_fn(|_| AtomicU32::new(0))),
            latency_write_idx: AtomicUsize::new(0),
            replayed_count: AtomicU64::new(0),
            silent_count: AtomicU64::new(0),
            inactive_count: AtomicU64::new(0),
            timed_out_count: AtomicU64::new(0),
            snapshot_overflow_count: AtomicU64::new(0),
            samples_delivered: AtomicU64::new(0),
        }
    }

    /// 在 callback 开头调用
    ///
    /// 只在采样点才读时钟，减少开销
    #[inline]
    pub fn on_callback(&self) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let now = now_ticks();
            let last = self.last_sampled_ticks.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last);
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % SAMPLE_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }
        }
    }

    /// 记录一次 callback 的结果
    ///
    /// `frames`: 本次从通道读到的样本数（只对 Fresh 有意义）
    #[inline]
    pub fn record_outcome(&self, outcome: BlockOutcome, frames: usize) {
        match outcome {
            BlockOutcome::Fresh => {
                self.fresh_count.fetch_add(1, Ordering::Relaxed);
                self.samples_delivered
                    .fetch_add(frames as u64, Ordering::Relaxed);
            }
            BlockOutcome::Replayed => {
                self.replayed_count.fetch_add(1, Ordering::Relaxed);
            }
            BlockOutcome::Silent => {
                self.silent_count.fetch_add(1, Ordering::Relaxed);
            }
            BlockOutcome::Inactive => {
                self.inactive_count.fetch_add(1, Ordering::Relaxed);
            }
            BlockOutcome::TimedOut => {
                self.timed_out_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 新块放不进重放缓冲区时调用
    #[inline]
    pub fn record_snapshot_overflow(&self) {
        self.snapshot_overflow_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次被接受的延迟测量（降频）
    #[inline]
    pub fn record_latency(&self, latency_ms: f32) {
        let count = self.fresh_count.load(Ordering::Relaxed);
        if count % SAMPLE_INTERVAL == 0 {
            let idx =
                self.latency_write_idx.fetch_add(1, Ordering::Relaxed) % SAMPLE_BUFFER_SIZE;
            self.latency_buffer[idx].store(latency_ms.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fresh_count(&self) -> u64 {
        self.fresh_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn replayed_count(&self) -> u64 {
        self.replayed_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timed_out_count(&self) -> u64 {
        self.timed_out_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn snapshot_overflow_count(&self) -> u64 {
        self.snapshot_overflow_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_delivered(&self) -> u64 {
        self.samples_delivered.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, frames_per_callback: u32, sample_rate: u32) -> StatsReport {
        // 期望的单次 callback 间隔（纳秒）
        let expected_interval_ns = if sample_rate > 0 {
            (frames_per_callback as u64 * 1_000_000_000) / sample_rate as u64
        } else {
            0
        };
        let expected_sampled_interval_ns = expected_interval_ns * SAMPLE_INTERVAL;

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|t| t.load(Ordering::Relaxed))
            .filter(|&t| t > 0)
            .map(ticks_to_ns)
            .collect();

        // 零值表示尚未写入的槽位
        let latencies: Vec<f32> = self
            .latency_buffer
            .iter()
            .map(|b| f32::from_bits(b.load(Ordering::Relaxed)))
            .filter(|&l| l > 0.0)
            .collect();

        let interval_stats = if intervals_ns.is_empty() {
            IntervalStats {
                min_ns: 0,
                max_ns: 0,
                avg_ns: 0,
            }
        } else {
            IntervalStats {
                min_ns: intervals_ns.iter().copied().fold(u64::MAX, u64::min),
                max_ns: intervals_ns.iter().copied().fold(0, u64::max),
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            }
        };

        let latency_stats = if latencies.is_empty() {
            LatencyStats {
                min_ms: 0.0,
                max_ms: 0.0,
                avg_ms: 0.0,
                samples: 0,
            }
        } else {
            LatencyStats {
                min_ms: latencies.iter().copied().fold(f32::MAX, f32::min),
                max_ms: latencies.iter().copied().fold(0.0, f32::max),
                avg_ms: latencies.iter().sum::<f32>() / latencies.len() as f32,
                samples: latencies.len(),
            }
        };

        StatsReport {
            callback_count: self.callback_count.load(Ordering::Relaxed),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            latency_stats,
            fresh_blocks: self.fresh_count.load(Ordering::Relaxed),
            replayed_blocks: self.replayed_count.load(Ordering::Relaxed),
            silent_blocks: self.silent_count.load(Ordering::Relaxed),
            inactive_blocks: self.inactive_count.load(Ordering::Relaxed),
            timed_out_blocks: self.timed_out_count.load(Ordering::Relaxed),
            snapshot_overflows: self.snapshot_overflow_count.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.last_sampled_ticks.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.fresh_count.store(0, Ordering::Relaxed);
        self.latency_write_idx.store(0, Ordering::Relaxed);
        self.replayed_count.store(0, Ordering::Relaxed);
        self.silent_count.store(0, Ordering::Relaxed);
        self.inactive_count.store(0, Ordering::Relaxed);
        self.timed_out_count.store(0, Ordering::Relaxed);
        self.snapshot_overflow_count.store(0, Ordering::Relaxed);
        self.samples_delivered.store(0, Ordering::Relaxed);

        for i in 0..SAMPLE_BUFFER_SIZE {
            self.interval_buffer[i].store(0, Ordering::Relaxed);
            self.latency_buffer[i].store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub latency_stats: LatencyStats,
    pub fresh_blocks: u64,
    pub replayed_blocks: u64,
    pub silent_blocks: u64,
    pub inactive_blocks: u64,
    pub timed_out_blocks: u64,
    pub snapshot_overflows: u64,
    pub samples_delivered: u64,
}

#[derive(Debug)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug)]
pub struct LatencyStats {
    pub min_ms: f32,
    pub max_ms: f32,
    pub avg_ms: f32,
    pub samples: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Receiver Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(
            f,
            "Stats sample interval: every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Callback Timing (per {} callbacks):",
            self.sample_interval
        )?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(
            f,
            "    Min: {:.2} ms",
            self.interval_stats.min_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Max: {:.2} ms",
            self.interval_stats.max_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Avg: {:.2} ms",
            self.interval_stats.avg_ns as f64 / 1_000_000.0
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Transport Latency ({} samples):",
            self.latency_stats.samples
        )?;
        writeln!(f, "  Min: {:.2} ms", self.latency_stats.min_ms)?;
        writeln!(f, "  Max: {:.2} ms", self.latency_stats.max_ms)?;
        writeln!(f, "  Avg: {:.2} ms", self.latency_stats.avg_ms)?;
        writeln!(f)?;

        writeln!(f, "Blocks:")?;
        writeln!(f, "  Fresh:     {}", self.fresh_blocks)?;
        writeln!(f, "  Replayed:  {}", self.replayed_blocks)?;
        writeln!(f, "  Silent:    {}", self.silent_blocks)?;
        writeln!(f, "  Inactive:  {}", self.inactive_blocks)?;
        writeln!(f, "  Timed out: {}", self.timed_out_blocks)?;
        if self.snapshot_overflows > 0 {
            writeln!(f, "  Oversized (not replayable): {}", self.snapshot_overflows)?;
        }
        writeln!(f)?;

        writeln!(f, "Samples delivered: {}", self.samples_delivered)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        let stats = ReceiverStats::new();
        stats.on_callback();
        stats.record_outcome(BlockOutcome::Fresh, 512);
        stats.on_callback();
        stats.record_outcome(BlockOutcome::Replayed, 0);
        stats.on_callback();
        stats.record_outcome(BlockOutcome::TimedOut, 0);

        assert_eq!(stats.callback_count(), 3);
        assert_eq!(stats.fresh_count(), 1);
        assert_eq!(stats.replayed_count(), 1);
        assert_eq!(stats.timed_out_count(), 1);
        assert_eq!(stats.samples_delivered(), 512);
    }

    #[test]
    fn test_latency_report() {
        let stats = ReceiverStats::new();
        // 每 SAMPLE_INTERVAL 个新块采一次
        for i in 0..(SAMPLE_INTERVAL * 3) {
            stats.record_latency(2.0 + (i / SAMPLE_INTERVAL) as f32);
            stats.record_outcome(BlockOutcome::Fresh, 64);
        }

        let report = stats.report(512, 48000);
        assert_eq!(report.latency_stats.samples, 3);
        assert_eq!(report.latency_stats.min_ms, 2.0);
        assert_eq!(report.latency_stats.max_ms, 4.0);
        assert!((report.latency_stats.avg_ms - 3.0).abs() < 1e-6);
        assert_eq!(report.fresh_blocks, SAMPLE_INTERVAL * 3);
    }

    #[test]
    fn test_empty_report_and_reset() {
        let stats = ReceiverStats::new();
        let report = stats.report(512, 48000);
        assert_eq!(report.callback_count, 0);
        assert_eq!(report.interval_stats.min_ns, 0);
        assert_eq!(report.latency_stats.samples, 0);
        assert!(report.to_string().contains("Receiver Statistics"));

        stats.on_callback();
        stats.record_outcome(BlockOutcome::Silent, 0);
        stats.record_snapshot_overflow();
        assert!(stats.report(512, 48000).to_string().contains("Oversized"));
        stats.reset();
        assert_eq!(stats.callback_count(), 0);
        assert_eq!(stats.snapshot_overflow_count(), 0);
        assert_eq!(stats.report(512, 48000).silent_blocks, 0);
    }
}
