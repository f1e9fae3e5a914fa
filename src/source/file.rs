//! 文件播放
//!
//! 每次按目标采样率生成固定长度的单声道块：
//! 1. 从 [`DecodedSource`] 拉取交错帧，按声道取平均降混为单声道
//! 2. 源采样率与目标不同则线性插值
//! 3. 源结束时块尾补零，下一块从源的第 0 个样本重新开始（循环）

use super::DecodedSource;
use crate::resample::{self, Resampler};

/// 每次从源拉取的帧数
const PULL_FRAMES: usize = 1024;

/// 文件播放器
pub struct FilePlayer {
    source: Box<dyn DecodedSource>,
    resampler: Box<dyn Resampler>,
    /// 当前重采样器对应的目标采样率
    target_rate: f64,
    /// 已降混但尚未消耗的源样本
    pending: Vec<f32>,
    /// 交错读取的临时缓冲区
    interleaved: Vec<f32>,
    /// 源已读到末尾
    exhausted: bool,
    /// 已循环次数
    loops: u64,
}

impl FilePlayer {
    pub fn new(source: Box<dyn DecodedSource>) -> Self {
        let channels = source.channels().max(1);
        let source_rate = source.source_sample_rate();
        Self {
            resampler: resample::for_rates(source_rate, source_rate),
            target_rate: source_rate,
            pending: Vec::with_capacity(PULL_FRAMES * 4),
            interleaved: vec![0.0; PULL_FRAMES * channels],
            exhausted: false,
            loops: 0,
            source,
        }
    }

    /// 源采样率
    pub fn source_sample_rate(&self) -> f64 {
        self.source.source_sample_rate()
    }

    /// 循环次数
    pub fn loop_count(&self) -> u64 {
        self.loops
    }

    /// 回到文件开头
    pub fn rewind(&mut self) {
        self.source.reset();
        self.resampler.reset();
        self.pending.clear();
        self.exhausted = false;
    }

    /// 按目标采样率生成一整块（长度恒为 `out.len()`）
    pub fn render(&mut self, out: &mut [f32], target_rate: f64) {
        if target_rate != self.target_rate {
            let source_rate = self.source.source_sample_rate();
            log::info!(
                "File playback rate: {}Hz -> {}Hz",
                source_rate,
                target_rate
            );
            self.resampler = resample::for_rates(source_rate, target_rate);
            self.target_rate = target_rate;
        }

        let mut produced = self.pull_block(out);
        if produced == 0 && self.exhausted {
            // 上一块恰好停在源末尾（源长度是拉取大小的整数倍）：从头开始，不插入静音块
            self.loop_to_start();
            produced = self.pull_block(out);
        }

        if produced < out.len() {
            // 源不够填满这一块：补零，并从头开始
            out[produced..].fill(0.0);
            self.loop_to_start();
        } else if self.exhausted && self.pending.len() < self.resampler.input_needed(1) {
            // 恰好用完：下一块直接从头开始
            self.loop_to_start();
        }
    }

    /// 补充 pending 并重采样到 `out`，返回写入的样本数
    fn pull_block(&mut self, out: &mut [f32]) -> usize {
        let needed = self.resampler.input_needed(out.len());
        self.fill_pending(needed);

        let processed = self.resampler.process(&self.pending, out);
        self.pending.drain(..processed.consumed);
        processed.produced
    }

    fn loop_to_start(&mut self) {
        log::debug!("End of source reached, looping to start");
        self.loops += 1;
        self.rewind();
    }

    /// 把 pending 补到至少 `needed` 个样本（或源结束）
    fn fill_pending(&mut self, needed: usize) {
        let channels = self.source.channels().max(1);

        let requested = self.interleaved.len() / channels;

        while self.pending.len() < needed && !self.exhausted {
            let frames = self.source.read_frames(&mut self.interleaved);
            // 返回少于请求即流结束
            if frames < requested {
                self.exhausted = true;
            }
            if frames == 0 {
                break;
            }

            if channels == 1 {
                self.pending.extend_from_slice(&self.interleaved[..frames]);
            } else {
                let scale = 1.0 / channels as f32;
                self.pending.extend(
                    self.interleaved[..frames * channels]
                        .chunks_exact(channels)
                        .map(|frame| frame.iter().sum::<f32>() * scale),
                );
            }
        }
    }
}
