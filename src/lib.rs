//! Shared-memory audio bridge
//!
//! Low-latency audio streaming from a generator process into a real-time
//! consumer callback through a named shared-memory single-slot channel.

pub mod audio;
pub mod decode;
pub mod engine;
pub mod receiver;
pub mod resample;
pub mod shm;
pub mod source;
