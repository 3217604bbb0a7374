//! Codec seams: demuxer, decoder, encoder and muxer
//!
//! The orchestrator only talks to these traits. All calls are non-blocking
//! polls with a short timeout; an adapter returning `None` just means "nothing
//! yet", and the caller retries on the next loop iteration.

mod surface;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use surface::{EncoderSurface, SurfaceFrame, SurfaceReceiver, DEFAULT_SURFACE_DEPTH};

use std::time::Duration;

use bytes::Bytes;

use crate::error::CodecError;
use crate::frame::YuvFrame;

/// Properties of the selected video track
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackInfo {
    pub width: u32,
    pub height: u32,
    /// Track duration in microseconds, 0 if unknown
    pub duration_us: i64,
    /// Average frame rate if the container reports one
    pub frame_rate: Option<f64>,
    pub codec_name: String,
}

impl VideoTrackInfo {
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us.max(0) as u64)
    }
}

/// One compressed frame read from the source container
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub pts_us: i64,
    pub keyframe: bool,
}

/// One result from [`VideoDecoder::poll_decoded`]
///
/// A frame must be handed back with [`VideoDecoder::release_output`] once the
/// orchestrator is done with it. The last output carries `end_of_stream` and
/// may have no frame; an output without a frame needs no release.
#[derive(Debug)]
pub struct DecoderOutput {
    pub buffer_id: u64,
    pub frame: Option<YuvFrame>,
    pub end_of_stream: bool,
}

/// Final encoder output format, announced once before any access unit
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFormat {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u64,
    /// Codec-specific data (SPS/PPS for H.264)
    pub codec_config: Vec<u8>,
}

/// One compressed frame produced by the encoder
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub pts_us: i64,
    pub dts_us: i64,
    pub keyframe: bool,
    pub end_of_stream: bool,
}

/// Output of [`VideoEncoder::poll_encoded`]
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    OutputFormat(OutputFormat),
    Unit(EncodedUnit),
}

/// Source container reader
pub trait Demuxer: Send {
    fn track_info(&self) -> &VideoTrackInfo;

    /// Next access unit of the selected track, `None` once the track is exhausted
    fn read_access_unit(&mut self) -> Result<Option<AccessUnit>, CodecError>;

    fn release(&mut self) -> Result<(), CodecError>;
}

/// Video decoder with a finite output buffer pool
pub trait VideoDecoder: Send {
    /// Wait up to `timeout` for an input slot; `false` means try again later
    fn dequeue_input_slot(&mut self, timeout: Duration) -> Result<bool, CodecError>;

    /// Queue one access unit into the slot obtained from `dequeue_input_slot`
    fn submit(&mut self, unit: AccessUnit) -> Result<(), CodecError>;

    /// Queue the end-of-stream marker into the slot obtained from `dequeue_input_slot`
    fn signal_end_of_input(&mut self) -> Result<(), CodecError>;

    fn poll_decoded(&mut self, timeout: Duration) -> Result<Option<DecoderOutput>, CodecError>;

    /// Return an output buffer to the pool
    fn release_output(&mut self, buffer_id: u64) -> Result<(), CodecError>;

    fn release(&mut self) -> Result<(), CodecError>;
}

/// Surface-driven video encoder
pub trait VideoEncoder: Send {
    /// The surface the compositor presents frames to
    fn input_surface(&self) -> EncoderSurface;

    /// No more frames will be presented
    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError>;

    fn poll_encoded(&mut self, timeout: Duration) -> Result<Option<EncoderEvent>, CodecError>;

    fn release(&mut self) -> Result<(), CodecError>;
}

/// Output container writer
pub trait Muxer: Send {
    /// Create the video track, must be called before `start`
    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    /// Write one sample; fails with [`CodecError::MuxerNotStarted`] before `start`
    fn write_sample(&mut self, track: usize, unit: &EncodedUnit) -> Result<(), CodecError>;

    /// Finalize the container (if started) and free resources
    fn release(&mut self) -> Result<(), CodecError>;
}
