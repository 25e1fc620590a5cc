//! Audio subsystem: frames, the duplex device, echo control, resampling
//! and WAV packing.

pub mod aec;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod resample;
pub mod ring_buffer;
pub mod wav;

pub use aec::{AecBackend, EchoCanceller, PassthroughAec};
pub use frame::{AudioFormat, AudioFrame, SampleEncoding};
pub use pipeline::{AecPipeline, PipelineConfig, PlaybackWriter};
pub use ring_buffer::RingBuffer;
