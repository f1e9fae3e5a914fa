//! 生产者的音频来源
//!
//! - Sine: 相位连续的正弦振荡器
//! - File: 解码后的文件播放（降混、重采样、循环）
//! - [`DecodedSource`]: 已解码 PCM 的外部协作者接口

pub mod file;
pub mod sine;

pub use file::FilePlayer;
pub use sine::SineOscillator;

/// 已解码音频的提供者
///
/// 文件解码本身交给外部（见 [`crate::decode`]），这里只关心交错的 f32 PCM
pub trait DecodedSource: Send {
    /// 源采样率
    fn source_sample_rate(&self) -> f64;

    /// 声道数
    fn channels(&self) -> usize;

    /// 读取交错帧到 `out`（长度应为声道数的整数倍）
    ///
    /// 返回实际读取的帧数；流结束时少于请求，之后返回 0
    fn read_frames(&mut self, out: &mut [f32]) -> usize;

    /// 回到开头
    fn reset(&mut self);
}

/// 完全载入内存的 PCM
#[derive(Debug, Clone)]
pub struct MemorySource {
    /// 交错样本
    samples: Vec<f32>,
    channels: usize,
    sample_rate: f64,
    /// 读取位置（帧）
    position: usize,
}

impl MemorySource {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: f64) -> Self {
        let channels = channels.max(1);
        let mut samples = samples;
        // 丢掉不完整的尾帧
        samples.truncate(samples.len() / channels * channels);
        Self {
            samples,
            channels,
            sample_rate,
            position: 0,
        }
    }

    /// 总帧数
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 时长（秒）
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.frames() as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

impl DecodedSource for MemorySource {
    fn source_sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        let wanted = out.len() / self.channels;
        let frames = wanted.min(self.frames() - self.position);
        let start = self.position * self.channels;
        let len = frames * self.channels;
        out[..len].copy_from_slice(&self.samples[start..start + len]);
        self.position += frames;
        frames
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_reads_to_end() {
        let mut src = MemorySource::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 44100.0);
        assert_eq!(src.frames(), 3);

        let mut out = [0.0f32; 4];
        assert_eq!(src.read_frames(&mut out), 2);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        assert_eq!(src.read_frames(&mut out), 1);
        assert_eq!(&out[..2], &[5.0, 6.0]);
        assert_eq!(src.read_frames(&mut out), 0);

        src.reset();
        assert_eq!(src.read_frames(&mut out), 2);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn test_memory_source_drops_partial_frame() {
        let src = MemorySource::new(vec![0.0; 5], 2, 48000.0);
        assert_eq!(src.frames(), 2);
    }
}
