#![deny(clippy::all)]

//! Streaming media player core.
//!
//! Ingests an opaque byte source (file blob or HTTP resource with byte
//! ranges), identifies the container, demuxes per-track encoded bitstreams
//! (ISO-BMFF, Matroska/WebM, MPEG-TS), and feeds external video/audio
//! decoders and a subtitle renderer so decoded output plays in wall-clock
//! synchrony with an audio-anchored timeline.
//!
//! The data model follows the WebCodecs shape: encoded chunks in, opaque
//! frames/PCM out, codec strings per the WebCodecs codec registry.

// Byte sources (memory, HTTP with range probing)
pub mod source;

// Timeline: media clock and the bounded frame ring
pub mod clock;
pub mod ring;

// Data model shared across the pipeline
pub mod media;

// Bitstream and codec-string helpers
pub mod codec;

// Container demuxers (MP4, MKV, TS)
pub mod demux;

// Subtitle cue pre-processing (ASS/SSA, PGS)
pub mod subtitle;

// External decoder contract
pub mod decode;

// Playback orchestrator and audio scheduling
pub mod player;

pub mod error;

pub use clock::MediaClock;
pub use decode::{
  AudioDecoder, AudioDecoderConfig, DecoderSupport, VideoDecoder, VideoDecoderConfig,
};
pub use demux::{ContainerFormat, Demuxer, DemuxEvent};
pub use error::{MediaError, Result};
pub use media::{
  AudioData, ChunkKind, EncodedAudioChunk, EncodedVideoChunk, SubtitleCue, TrackDescriptor,
  TrackKind, VideoFrame,
};
pub use player::{
  MediaSource, Pipeline, Player, PlayerEvent, PlayerInit, SubtitleHandler, VideoRenderer,
};
pub use player::audio::{AudioOutput, AudioScheduler};
pub use ring::FrameRing;
pub use source::{ByteSource, MemoryByteSource, SharedByteSource};
pub use source::http::{HttpByteSource, RequestPolicy};
