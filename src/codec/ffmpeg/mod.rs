//! FFmpeg-backed codec adapters
//!
//! Software decode and encode through libavcodec, container I/O through
//! libavformat. All timestamps crossing the adapter boundary are in
//! microseconds.

mod decode;
mod demux;
mod encode;
mod mux;

pub use decode::FfmpegDecoder;
pub use demux::FfmpegDemuxer;
pub use encode::FfmpegEncoder;
pub use mux::Mp4Muxer;

use std::path::Path;

use ffmpeg_next as ffmpeg;

use crate::error::CodecError;

/// Microsecond time base used for every timestamp leaving an adapter
pub(crate) fn micros() -> ffmpeg::Rational {
    ffmpeg::Rational::new(1, 1_000_000)
}

pub(crate) fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(
        err,
        ffmpeg::Error::Other {
            errno: ffmpeg::error::EAGAIN
        }
    )
}

/// Open `path` and create a decoder for its first video track
pub fn open_source(path: &Path, pool_size: usize) -> Result<(FfmpegDemuxer, FfmpegDecoder), CodecError> {
    ffmpeg::init()?;

    let input = ffmpeg::format::input(&path)
        .map_err(|e| CodecError::OpenFailed(format!("{}: {}", path.display(), e)))?;

    let (stream_index, time_base, decoder) = {
        let stream = input
            .streams()
            .find(|s| s.parameters().medium() == ffmpeg::media::Type::Video)
            .ok_or(CodecError::NoVideoTrack)?;

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| CodecError::DecoderCreation(e.to_string()))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| CodecError::DecoderCreation(e.to_string()))?;

        (stream.index(), stream.time_base(), decoder)
    };

    let demuxer = FfmpegDemuxer::new(input, stream_index, time_base, &decoder)?;
    let decoder = FfmpegDecoder::new(decoder, pool_size);
    Ok((demuxer, decoder))
}
