//! 音频文件解码（文件模式的外部协作者）

pub mod decoder;

pub use decoder::{load_file, AudioDecoder, AudioInfo, DecodeError};
