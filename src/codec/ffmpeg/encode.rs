use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use super::{is_again, micros};
use crate::codec::{
    EncodedUnit, EncoderEvent, EncoderSurface, OutputFormat, SurfaceFrame, SurfaceReceiver, VideoEncoder,
    DEFAULT_SURFACE_DEPTH,
};
use crate::config::EncoderSettings;
use crate::error::CodecError;

/// H.264 encoder fed from an [`EncoderSurface`]
pub struct FfmpegEncoder {
    encoder: Option<ffmpeg::encoder::Video>,
    surface: EncoderSurface,
    receiver: SurfaceReceiver,
    scaler: Option<(u32, u32, scaling::Context)>,
    width: u32,
    height: u32,
    format: OutputFormat,
    format_emitted: bool,
    eos_requested: bool,
    eos_sent: bool,
    eos_reported: bool,
}

// Codec and scaler contexts are only ever driven by the thread that owns the adapter.
unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    /// Open an H.264 encoder, preferring libx264
    ///
    /// Odd dimensions are rounded down to even, as 4:2:0 requires.
    pub fn new(width: u32, height: u32, settings: &EncoderSettings) -> Result<Self, CodecError> {
        ffmpeg::init()?;

        let codec = ffmpeg::encoder::find_by_name("libx264")
            .or_else(|| ffmpeg::encoder::find(ffmpeg::codec::Id::H264))
            .ok_or_else(|| CodecError::EncoderCreation("no H.264 encoder available".to_string()))?;

        let (width, height) = (width & !1, height & !1);
        if width == 0 || height == 0 {
            return Err(CodecError::EncoderCreation(format!("invalid size {width}x{height}")));
        }

        let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| CodecError::EncoderCreation(e.to_string()))?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(micros());
        video.set_frame_rate(Some(ffmpeg::Rational::new(settings.frame_rate as i32, 1)));
        video.set_bit_rate(settings.bit_rate as usize);
        video.set_gop(settings.gop_size());
        video.set_max_b_frames(0);
        // MP4 wants SPS/PPS in extradata rather than in-band
        video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);

        let mut options = ffmpeg::Dictionary::new();
        if codec.name() == "libx264" {
            options.set("preset", "veryfast");
        }
        let encoder = video
            .open_as_with(codec, options)
            .map_err(|e| CodecError::EncoderCreation(e.to_string()))?;

        let codec_config = unsafe {
            let ctx = encoder.as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize).to_vec()
            }
        };

        tracing::info!(
            "Encoder {} opened: {}x{} @ {} fps, {} bps, GOP {}",
            codec.name(),
            width,
            height,
            settings.frame_rate,
            settings.bit_rate,
            settings.gop_size()
        );

        let (surface, receiver) = EncoderSurface::channel(DEFAULT_SURFACE_DEPTH);
        Ok(Self {
            encoder: Some(encoder),
            surface,
            receiver,
            scaler: None,
            width,
            height,
            format: OutputFormat {
                mime_type: EncoderSettings::MIME_TYPE.to_string(),
                width,
                height,
                frame_rate: settings.frame_rate,
                bit_rate: settings.bit_rate,
                codec_config,
            },
            format_emitted: false,
            eos_requested: false,
            eos_sent: false,
            eos_reported: false,
        })
    }

    fn encoder(&mut self) -> Result<&mut ffmpeg::encoder::Video, CodecError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| CodecError::Encode("encoder released".to_string()))
    }

    /// Convert one presented RGBA frame to YUV420P and send it
    fn encode_frame(&mut self, frame: SurfaceFrame) -> Result<(), CodecError> {
        let mut rgba = ffmpeg::frame::Video::new(Pixel::RGBA, frame.width, frame.height);
        let row_bytes = frame.width as usize * 4;
        let stride = rgba.stride(0);
        let dst = rgba.data_mut(0);
        for (row, src) in frame.rgba.chunks_exact(row_bytes).enumerate() {
            dst[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }

        let stale = !matches!(&self.scaler, Some((w, h, _)) if *w == frame.width && *h == frame.height);
        if stale {
            let context = scaling::Context::get(
                Pixel::RGBA,
                frame.width,
                frame.height,
                Pixel::YUV420P,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((frame.width, frame.height, context));
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        if let Some((_, _, scaler)) = self.scaler.as_mut() {
            scaler.run(&rgba, &mut yuv)?;
        }
        yuv.set_pts(Some(frame.timestamp_us));

        self.encoder()?
            .send_frame(&yuv)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn input_surface(&self) -> EncoderSurface {
        self.surface.clone()
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        self.eos_requested = true;
        Ok(())
    }

    fn poll_encoded(&mut self, _timeout: Duration) -> Result<Option<EncoderEvent>, CodecError> {
        if !self.format_emitted {
            self.format_emitted = true;
            return Ok(Some(EncoderEvent::OutputFormat(self.format.clone())));
        }

        loop {
            let mut packet = ffmpeg::Packet::empty();
            match self.encoder()?.receive_packet(&mut packet) {
                Ok(()) => {
                    let pts = packet.pts().unwrap_or(0);
                    return Ok(Some(EncoderEvent::Unit(EncodedUnit {
                        data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
                        pts_us: pts,
                        dts_us: packet.dts().unwrap_or(pts),
                        keyframe: packet.is_key(),
                        end_of_stream: false,
                    })));
                }
                Err(e) if is_again(&e) => {
                    // Output drained, so the encoder is ready for the next input
                    if let Some(frame) = self.receiver.try_next() {
                        self.encode_frame(frame)?;
                        continue;
                    }
                    if self.eos_requested && !self.eos_sent {
                        self.encoder()?.send_eof()?;
                        self.eos_sent = true;
                        continue;
                    }
                    return Ok(None);
                }
                Err(ffmpeg::Error::Eof) => {
                    if self.eos_reported {
                        return Ok(None);
                    }
                    self.eos_reported = true;
                    return Ok(Some(EncoderEvent::Unit(EncodedUnit {
                        data: Bytes::new(),
                        pts_us: 0,
                        dts_us: 0,
                        keyframe: false,
                        end_of_stream: true,
                    })));
                }
                Err(e) => return Err(CodecError::Encode(e.to_string())),
            }
        }
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.scaler = None;
        if self.encoder.take().is_some() {
            tracing::debug!("Encoder released");
        }
        Ok(())
    }
}
