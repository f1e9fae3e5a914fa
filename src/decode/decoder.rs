//! 音频文件解码器
//!
//! 使用 symphonia 库解码音频文件
//! 支持：FLAC, WAV, AIFF, MP3
//!
//! 生成器的文件模式把整个文件解码进内存，然后按块读取，
//! 解码只发生在加载时，不在生产者循环里。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::source::MemorySource;

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    /// 文件打开失败
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    /// 格式不支持
    #[error("unsupported audio format")]
    UnsupportedFormat,
    /// 没有找到音频轨道
    #[error("no audio track found")]
    NoAudioTrack,
    /// 解码器创建失败
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    /// 解码失败
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// 文件里没有任何样本
    #[error("file contains no audio samples")]
    Empty,
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// 采样率
    pub sample_rate: u32,
    /// 声道数（容器未声明时为 0，解码第一个包后更新）
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 格式名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    /// 交错 f32 样本缓冲区
    sample_buffer: Option<SampleBuffer<f32>>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // 提示文件扩展名
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        // 查找第一个音频轨道
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(0);
        let bit_depth = codec_params.bits_per_sample;
        let total_frames = codec_params.n_frames;
        let duration_secs = total_frames.map(|f| f as f64 / sample_rate as f64);

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth,
            total_frames,
            duration_secs,
            format: format_name,
            codec: codec_name,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            sample_buffer: None,
        })
    }

    /// 获取音频信息
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一块数据
    ///
    /// 返回交错格式的 f32 样本，空切片表示文件结束
    pub fn decode_next(&mut self) -> Result<&[f32], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(&[]);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(&[]),
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => continue, // 跳过损坏的帧
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            self.info.channels = resolve_channels(
                self.info.channels,
                spec.channels.count() as u32,
                self.sample_buffer.is_none(),
            )?;
            let needed = decoded.capacity() * spec.channels.count();

            // 容量不足时重建缓冲区（通常只在第一个 packet 发生）
            let rebuild = self
                .sample_buffer
                .as_ref()
                .map(|b| b.capacity() < needed)
                .unwrap_or(true);
            if rebuild {
                self.sample_buffer = Some(SampleBuffer::<f32>::new(
                    decoded.capacity() as u64,
                    spec,
                ));
            }

            if let Some(buffer) = self.sample_buffer.as_mut() {
                buffer.copy_interleaved_ref(decoded);
            }
            return Ok(self
                .sample_buffer
                .as_ref()
                .map(|b| b.samples())
                .unwrap_or(&[]));
        }
    }
}

/// 以解码出的声道布局为准
///
/// 第一个包可以修正容器声明的声道数；之后声道数变化视为错误
fn resolve_channels(current: u32, decoded: u32, first_packet: bool) -> Result<u32, DecodeError> {
    if decoded == 0 {
        return Err(DecodeError::DecodeFailed(
            "decoded packet has no channels".to_string(),
        ));
    }
    if current == decoded {
        return Ok(current);
    }
    if first_packet {
        if current != 0 {
            log::warn!(
                "Container declares {} channels but stream decodes {}",
                current,
                decoded
            );
        }
        return Ok(decoded);
    }
    Err(DecodeError::DecodeFailed(format!(
        "channel count changed from {} to {} mid-stream",
        current, decoded
    )))
}

/// 把整个文件解码进内存
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<(MemorySource, AudioInfo), DecodeError> {
    let path = path.as_ref();
    let mut decoder = AudioDecoder::open(path)?;
    let info = decoder.info();

    log::info!(
        "Loading: {} | Format: {} | Codec: {} | {}Hz {}ch",
        path.display(),
        info.format,
        info.codec,
        info.sample_rate,
        info.channels
    );

    let capacity = info
        .total_frames
        .map(|f| f as usize * info.channels as usize)
        .unwrap_or(0);
    let mut samples = Vec::with_capacity(capacity);

    loop {
        let chunk = decoder.decode_next()?;
        if chunk.is_empty() {
            break;
        }
        samples.extend_from_slice(chunk);
    }

    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }

    let info = decoder.info().clone();

    let source = MemorySource::new(samples, info.channels as usize, info.sample_rate as f64);
    log::info!("Decoded {:.2}s of audio", source.duration_secs());

    Ok((source, info))
}
