use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use super::is_again;
use crate::codec::{AccessUnit, DecoderOutput, VideoDecoder};
use crate::error::CodecError;
use crate::frame::{Plane, YuvFrame};

/// Software decoder with a bounded number of frames handed out at once
///
/// YUV420P frames are passed through with their native strides, NV12/NV21
/// chroma is exposed as two interleaved planes over one buffer, anything else
/// is converted to YUV420P first.
pub struct FfmpegDecoder {
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<(Pixel, u32, u32, scaling::Context)>,
    ready: VecDeque<ffmpeg::frame::Video>,
    /// Packet the decoder refused with EAGAIN, resent before anything else
    pending: Option<ffmpeg::Packet>,
    outstanding: HashSet<u64>,
    next_buffer_id: u64,
    pool_size: usize,
    eof_requested: bool,
    eof_sent: bool,
    drained: bool,
    eos_reported: bool,
}

// Codec and scaler contexts are only ever driven by the thread that owns the adapter.
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub(super) fn new(decoder: ffmpeg::decoder::Video, pool_size: usize) -> Self {
        Self {
            decoder: Some(decoder),
            scaler: None,
            ready: VecDeque::new(),
            pending: None,
            outstanding: HashSet::new(),
            next_buffer_id: 0,
            pool_size: pool_size.max(1),
            eof_requested: false,
            eof_sent: false,
            drained: false,
            eos_reported: false,
        }
    }

    fn decoder(&mut self) -> Result<&mut ffmpeg::decoder::Video, CodecError> {
        self.decoder
            .as_mut()
            .ok_or_else(|| CodecError::Decode("decoder released".to_string()))
    }

    fn send(&mut self, packet: ffmpeg::Packet) -> Result<(), CodecError> {
        let pts = packet.pts();
        match self.decoder()?.send_packet(&packet) {
            Ok(()) => Ok(()),
            Err(e) if is_again(&e) => {
                self.pending = Some(packet);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable access unit at {:?}us: {}", pts, e);
                Ok(())
            }
        }
    }

    /// Move decoded frames into the ready queue while the pool has room
    fn pump(&mut self) -> Result<(), CodecError> {
        loop {
            if let Some(packet) = self.pending.take() {
                self.send(packet)?;
            }
            if self.pending.is_none() && self.eof_requested && !self.eof_sent {
                self.decoder()?.send_eof()?;
                self.eof_sent = true;
            }
            if self.drained || self.ready.len() + self.outstanding.len() >= self.pool_size {
                return Ok(());
            }

            let mut frame = ffmpeg::frame::Video::empty();
            match self.decoder()?.receive_frame(&mut frame) {
                Ok(()) => self.ready.push_back(frame),
                Err(e) if is_again(&e) => return Ok(()),
                Err(ffmpeg::Error::Eof) => {
                    self.drained = true;
                    return Ok(());
                }
                Err(e) => return Err(CodecError::Decode(e.to_string())),
            }
        }
    }

    fn to_yuv(&mut self, frame: ffmpeg::frame::Video) -> Result<YuvFrame, CodecError> {
        let pts_us = frame.timestamp().or_else(|| frame.pts()).unwrap_or(0);
        let (width, height) = (frame.width(), frame.height());

        match frame.format() {
            Pixel::YUV420P | Pixel::YUVJ420P => Ok(planar(&frame, pts_us)),
            Pixel::NV12 | Pixel::NV21 => {
                let uv = Bytes::copy_from_slice(frame.data(1));
                let first = Plane {
                    data: uv.clone(),
                    row_stride: frame.stride(1),
                    pixel_stride: 2,
                };
                let second = Plane {
                    data: uv.slice(1..),
                    row_stride: frame.stride(1),
                    pixel_stride: 2,
                };
                let (u, v) = if frame.format() == Pixel::NV12 {
                    (first, second)
                } else {
                    (second, first)
                };
                Ok(YuvFrame {
                    width,
                    height,
                    y: Plane {
                        data: Bytes::copy_from_slice(frame.data(0)),
                        row_stride: frame.stride(0),
                        pixel_stride: 1,
                    },
                    u,
                    v,
                    pts_us,
                })
            }
            other => {
                let stale = !matches!(&self.scaler, Some((f, w, h, _)) if *f == other && *w == width && *h == height);
                if stale {
                    tracing::debug!("Converting decoder output {:?} to YUV420P", other);
                    let context = scaling::Context::get(
                        other,
                        width,
                        height,
                        Pixel::YUV420P,
                        width,
                        height,
                        scaling::Flags::BILINEAR,
                    )?;
                    self.scaler = Some((other, width, height, context));
                }
                let mut converted = ffmpeg::frame::Video::empty();
                if let Some((_, _, _, scaler)) = self.scaler.as_mut() {
                    scaler.run(&frame, &mut converted)?;
                }
                Ok(planar(&converted, pts_us))
            }
        }
    }
}

fn planar(frame: &ffmpeg::frame::Video, pts_us: i64) -> YuvFrame {
    let plane = |index: usize| Plane {
        data: Bytes::copy_from_slice(frame.data(index)),
        row_stride: frame.stride(index),
        pixel_stride: 1,
    };
    YuvFrame {
        width: frame.width(),
        height: frame.height(),
        y: plane(0),
        u: plane(1),
        v: plane(2),
        pts_us,
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<bool, CodecError> {
        // Software decoding never blocks, so the timeout is not needed
        self.pump()?;
        Ok(self.pending.is_none() && !self.eof_requested)
    }

    fn submit(&mut self, unit: AccessUnit) -> Result<(), CodecError> {
        if self.pending.is_some() {
            return Err(CodecError::Decode("no input slot available".to_string()));
        }
        let mut packet = ffmpeg::Packet::copy(&unit.data);
        packet.set_pts(Some(unit.pts_us));
        if unit.keyframe {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        self.send(packet)
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.eof_requested = true;
        self.pump()
    }

    fn poll_decoded(&mut self, _timeout: Duration) -> Result<Option<DecoderOutput>, CodecError> {
        self.pump()?;

        if let Some(frame) = self.ready.pop_front() {
            let frame = self.to_yuv(frame)?;
            let buffer_id = self.next_buffer_id;
            self.next_buffer_id += 1;
            self.outstanding.insert(buffer_id);
            return Ok(Some(DecoderOutput {
                buffer_id,
                frame: Some(frame),
                end_of_stream: false,
            }));
        }

        if self.drained && !self.eos_reported {
            self.eos_reported = true;
            let buffer_id = self.next_buffer_id;
            self.next_buffer_id += 1;
            return Ok(Some(DecoderOutput {
                buffer_id,
                frame: None,
                end_of_stream: true,
            }));
        }

        Ok(None)
    }

    fn release_output(&mut self, buffer_id: u64) -> Result<(), CodecError> {
        if self.outstanding.remove(&buffer_id) {
            Ok(())
        } else {
            Err(CodecError::UnknownBuffer(buffer_id))
        }
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.ready.clear();
        self.pending = None;
        self.outstanding.clear();
        self.scaler = None;
        if self.decoder.take().is_some() {
            tracing::debug!("Decoder released");
        }
        Ok(())
    }
}
