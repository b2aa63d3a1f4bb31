//! Data model shared across demuxers, decoders and the orchestrator.

mod chunk;
mod frame;
mod subtitle;
mod track;

pub use chunk::{ChunkKind, EncodedAudioChunk, EncodedVideoChunk};
pub use frame::{AudioData, DecodedSurface, VideoFrame};
pub use subtitle::SubtitleCue;
pub use track::{SubtitleFormat, TrackDescriptor, TrackKind};
