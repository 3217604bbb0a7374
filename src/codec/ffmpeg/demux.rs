use bytes::Bytes;
use ffmpeg_next as ffmpeg;

use super::micros;
use crate::codec::{AccessUnit, Demuxer, VideoTrackInfo};
use crate::error::CodecError;

/// Reads access units of one video stream from a container
pub struct FfmpegDemuxer {
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    info: VideoTrackInfo,
}

// The format context is only ever driven by the thread that owns the adapter.
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub(super) fn new(
        input: ffmpeg::format::context::Input,
        stream_index: usize,
        time_base: ffmpeg::Rational,
        decoder: &ffmpeg::decoder::Video,
    ) -> Result<Self, CodecError> {
        let stream = input.stream(stream_index).ok_or(CodecError::NoVideoTrack)?;

        let duration_us = if stream.duration() > 0 {
            (stream.duration() as f64 * f64::from(time_base) * 1_000_000.0) as i64
        } else if input.duration() > 0 {
            input.duration() * 1_000_000 / ffmpeg::ffi::AV_TIME_BASE as i64
        } else {
            0
        };

        let rate = stream.avg_frame_rate();
        let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0).then(|| f64::from(rate));

        let codec_name = decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let info = VideoTrackInfo {
            width: decoder.width(),
            height: decoder.height(),
            duration_us,
            frame_rate,
            codec_name,
        };

        tracing::info!(
            "Opened source: {}x{}, {:.2}s, {} fps, codec {}",
            info.width,
            info.height,
            duration_us as f64 / 1_000_000.0,
            frame_rate.map_or_else(|| "?".to_string(), |r| format!("{r:.2}")),
            info.codec_name
        );

        Ok(Self {
            input: Some(input),
            stream_index,
            time_base,
            info,
        })
    }
}

impl Demuxer for FfmpegDemuxer {
    fn track_info(&self) -> &VideoTrackInfo {
        &self.info
    }

    fn read_access_unit(&mut self) -> Result<Option<AccessUnit>, CodecError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        for (stream, mut packet) in input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            packet.rescale_ts(self.time_base, micros());
            let Some(data) = packet.data() else {
                continue;
            };
            return Ok(Some(AccessUnit {
                data: Bytes::copy_from_slice(data),
                pts_us: packet.pts().or(packet.dts()).unwrap_or(0),
                keyframe: packet.is_key(),
            }));
        }
        Ok(None)
    }

    fn release(&mut self) -> Result<(), CodecError> {
        if self.input.take().is_some() {
            tracing::debug!("Demuxer released");
        }
        Ok(())
    }
}
