//! 正弦振荡器
//!
//! 相位跨块保留，块边界没有不连续（不会出现咔哒声）

use std::f64::consts::TAU;

/// 相位累加正弦振荡器
#[derive(Debug, Clone, Default)]
pub struct SineOscillator {
    /// 当前相位，范围 [0, 2π)
    phase: f64,
}

impl SineOscillator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前相位
    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// 生成一块样本，相位接着上一块继续
    pub fn render(&mut self, out: &mut [f32], frequency: f32, sample_rate: f64) {
        let increment = TAU * frequency as f64 / sample_rate;
        let mut phase = self.phase;

        for sample in out.iter_mut() {
            *sample = phase.sin() as f32;
            phase += increment;
            if phase >= TAU {
                phase %= TAU;
            }
        }

        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_match_continuous_generation() {
        let block = 256;
        let blocks = 8;

        let mut continuous = vec![0.0f32; block * blocks];
        SineOscillator::new().render(&mut continuous, 440.0, 48000.0);

        let mut osc = SineOscillator::new();
        let mut joined = Vec::with_capacity(block * blocks);
        let mut buf = vec![0.0f32; block];
        for _ in 0..blocks {
            osc.render(&mut buf, 440.0, 48000.0);
            joined.extend_from_slice(&buf);
        }

        for (i, (a, b)) in joined.iter().zip(&continuous).enumerate() {
            assert!((a - b).abs() < 1e-6, "sample {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_phase_stays_wrapped() {
        let mut osc = SineOscillator::new();
        let mut buf = vec![0.0f32; 1000];
        for _ in 0..50 {
            osc.render(&mut buf, 19999.0, 44100.0);
            assert!(osc.phase() >= 0.0 && osc.phase() < TAU);
        }
    }

    #[test]
    fn test_quarter_period() {
        // 1 kHz @ 4 kHz：每样本前进 π/2
        let mut osc = SineOscillator::new();
        let mut buf = [0.0f32; 4];
        osc.render(&mut buf, 1000.0, 4000.0);
        let expected = [0.0, 1.0, 0.0, -1.0];
        for (a, b) in buf.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
