//! Subtitle cue pre-processing used by the MKV demuxer.
//!
//! ASS/SSA dialogue projection and PGS packet assembly; rendering (ASS
//! compositing, PGS RLE decoding) is the consumer's job.

pub mod ass;
pub mod pgs;
