use std::path::{Path, PathBuf};
use std::ptr;

use ffmpeg_next as ffmpeg;

use super::micros;
use crate::codec::{EncodedUnit, Muxer, OutputFormat};
use crate::error::CodecError;

/// MP4 writer for a single H.264 track
pub struct Mp4Muxer {
    output: Option<ffmpeg::format::context::Output>,
    path: PathBuf,
    track: Option<usize>,
    time_base: ffmpeg::Rational,
    started: bool,
    samples: u64,
    /// Applied to packets the encoder left without a duration
    frame_duration_us: i64,
}

// The format context is only ever driven by the thread that owns the adapter.
unsafe impl Send for Mp4Muxer {}

impl Mp4Muxer {
    pub fn create(path: &Path) -> Result<Self, CodecError> {
        ffmpeg::init()?;
        let output = ffmpeg::format::output_as(&path, "mp4")
            .map_err(|e| CodecError::Muxer(format!("cannot create {}: {}", path.display(), e)))?;
        Ok(Self {
            output: Some(output),
            path: path.to_path_buf(),
            track: None,
            time_base: micros(),
            started: false,
            samples: 0,
            frame_duration_us: 0,
        })
    }

    fn output(&mut self) -> Result<&mut ffmpeg::format::context::Output, CodecError> {
        self.output
            .as_mut()
            .ok_or_else(|| CodecError::Muxer("muxer released".to_string()))
    }
}

impl Muxer for Mp4Muxer {
    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, CodecError> {
        if self.started {
            return Err(CodecError::Muxer("cannot add a track after start".to_string()));
        }

        let mut params = ffmpeg::codec::Parameters::new();
        unsafe {
            let par = params.as_mut_ptr();
            (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = ffmpeg::ffi::AVCodecID::AV_CODEC_ID_H264;
            (*par).width = format.width as i32;
            (*par).height = format.height as i32;
            (*par).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
            (*par).bit_rate = format.bit_rate as i64;
            if !format.codec_config.is_empty() {
                let size = format.codec_config.len();
                let buf = ffmpeg::ffi::av_mallocz(size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
                if buf.is_null() {
                    return Err(CodecError::Muxer("failed to allocate codec config".to_string()));
                }
                ptr::copy_nonoverlapping(format.codec_config.as_ptr(), buf, size);
                (*par).extradata = buf;
                (*par).extradata_size = size as i32;
            }
        }

        let output = self.output()?;
        let mut stream = output.add_stream(ffmpeg::codec::Id::H264)?;
        stream.set_parameters(params);
        stream.set_time_base(micros());
        stream.set_avg_frame_rate(ffmpeg::Rational::new(format.frame_rate as i32, 1));
        let index = stream.index();

        tracing::debug!("Muxer track {} added: {}x{} {}", index, format.width, format.height, format.mime_type);
        self.track = Some(index);
        self.frame_duration_us = 1_000_000 / format.frame_rate.max(1) as i64;
        Ok(index)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.started {
            return Ok(());
        }
        let track = self
            .track
            .ok_or_else(|| CodecError::Muxer("start called before add_track".to_string()))?;
        let output = self.output()?;
        output.write_header()?;
        // The container may pick its own timescale while writing the header
        let time_base = output.stream(track).map(|s| s.time_base()).unwrap_or_else(micros);
        self.time_base = time_base;
        self.started = true;
        tracing::info!("Muxer started: {}", self.path.display());
        Ok(())
    }

    fn write_sample(&mut self, track: usize, unit: &EncodedUnit) -> Result<(), CodecError> {
        if !self.started {
            return Err(CodecError::MuxerNotStarted);
        }
        if unit.data.is_empty() {
            return Ok(());
        }

        let mut packet = ffmpeg::Packet::copy(&unit.data);
        packet.set_pts(Some(unit.pts_us));
        packet.set_dts(Some(unit.dts_us));
        packet.set_stream(track);
        if unit.keyframe {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        // Without it the last sample has no length and the track comes up one frame short
        if packet.duration() == 0 {
            packet.set_duration(self.frame_duration_us);
        }
        packet.rescale_ts(micros(), self.time_base);

        let output = self.output()?;
        packet.write_interleaved(output)?;
        self.samples += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), CodecError> {
        let Some(mut output) = self.output.take() else {
            return Ok(());
        };
        if self.started {
            output.write_trailer()?;
            tracing::info!("Muxer finished {} ({} samples)", self.path.display(), self.samples);
        }
        Ok(())
    }
}

impl Drop for Mp4Muxer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to finalize {}: {}", self.path.display(), e);
        }
    }
}
