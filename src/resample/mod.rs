//! 重采样模块
//!
//! 文件模式下源文件采样率与消费者请求的采样率不同时使用。
//! 只提供朴素线性插值：在分数源位置 `frac + i * (源采样率 / 目标采样率)` 上
//! 对相邻两个源样本做线性插值，分数部分跨块保留。

/// 一次处理的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    /// 输出的样本数
    pub produced: usize,
    /// 已完全消耗、可以丢弃的输入样本数
    pub consumed: usize,
}

/// 重采样器特征
pub trait Resampler: Send {
    /// 生成 `output_len` 个样本需要的输入样本数
    fn input_needed(&self, output_len: usize) -> usize;

    /// 处理样本（单声道）
    ///
    /// 输入不足时提前停止，`produced < output.len()`
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Processed;

    /// 重置状态（回到源的整数位置 0）
    fn reset(&mut self);

    /// 获取输入/输出采样率比
    fn ratio(&self) -> f64;
}

/// 直通重采样器（不做任何处理）
pub struct PassthroughResampler;

impl Resampler for PassthroughResampler {
    fn input_needed(&self, output_len: usize) -> usize {
        output_len
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Processed {
        let len = input.len().min(output.len());
        output[..len].copy_from_slice(&input[..len]);
        Processed {
            produced: len,
            consumed: len,
        }
    }

    fn reset(&mut self) {}

    fn ratio(&self) -> f64 {
        1.0
    }
}

/// 线性插值重采样器
pub struct LinearResampler {
    /// 源采样率 / 目标采样率
    ratio: f64,
    /// 下一个输出样本在输入中的分数位置
    frac: f64,
}

impl LinearResampler {
    pub fn new(source_rate: f64, target_rate: f64) -> Self {
        Self {
            ratio: source_rate / target_rate,
            frac: 0.0,
        }
    }
}

impl Resampler for LinearResampler {
    fn input_needed(&self, output_len: usize) -> usize {
        if output_len == 0 {
            return 0;
        }
        let last = self.frac + (output_len - 1) as f64 * self.ratio;
        last.floor() as usize + 2
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Processed {
        let mut produced = 0;

        for (i, out) in output.iter_mut().enumerate() {
            let pos = self.frac + i as f64 * self.ratio;
            let i0 = pos as usize;
            let i1 = i0 + 1;

            // 越界保护：需要左右两个邻居
            if i1 >= input.len() {
                break;
            }

            let fraction = (pos - i0 as f64) as f32;
            *out = input[i0] + fraction * (input[i1] - input[i0]);
            produced += 1;
        }

        let end = self.frac + produced as f64 * self.ratio;
        let consumed = (end.floor() as usize).min(input.len());
        self.frac = end - consumed as f64;

        Processed { produced, consumed }
    }

    fn reset(&mut self) {
        self.frac = 0.0;
    }

    fn ratio(&self) -> f64 {
        self.ratio
    }
}

/// 采样率差异低于这个值时直通
pub const RATE_TOLERANCE: f64 = 0.01;

/// 根据源 / 目标采样率选择重采样器
pub fn for_rates(source_rate: f64, target_rate: f64) -> Box<dyn Resampler> {
    if (source_rate - target_rate).abs() > RATE_TOLERANCE {
        Box::new(LinearResampler::new(source_rate, target_rate))
    } else {
        Box::new(PassthroughResampler)
    }
}
