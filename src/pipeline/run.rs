use std::path::Path;
use std::time::{Duration, Instant};

use super::{CancelToken, MediaBackend, ModeSwitch, PipelineStage, ProgressTracker, RunSummary, SourceMedia};
use crate::codec::{Demuxer, EncoderEvent, Muxer, VideoDecoder, VideoEncoder};
use crate::compositor::Compositor;
use crate::config::ProcessorConfig;
use crate::error::{CodecError, FrameError, PipelineError, Result};
use crate::frame::{frame_to_rgb, YuvFrame};
use crate::segmentation::{MonotonicTimestamps, SegmentationEngine};

const STATS_INTERVAL: u64 = 30;

/// Everything acquired for one run, released in a fixed order on every exit path
#[derive(Default)]
struct RunResources {
    compositor: Option<Box<dyn Compositor>>,
    demuxer: Option<Box<dyn Demuxer>>,
    decoder: Option<Box<dyn VideoDecoder>>,
    encoder: Option<Box<dyn VideoEncoder>>,
    muxer: Option<Box<dyn Muxer>>,
}

impl RunResources {
    fn release_all(&mut self) {
        if let Some(mut compositor) = self.compositor.take() {
            compositor.release();
        }
        log_release("demuxer", self.demuxer.take().map(|mut d| d.release()));
        log_release("decoder", self.decoder.take().map(|mut d| d.release()));
        log_release("encoder", self.encoder.take().map(|mut e| e.release()));
        log_release("muxer", self.muxer.take().map(|mut m| m.release()));
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn log_release(name: &str, result: Option<Result<(), CodecError>>) {
    if let Some(Err(e)) = result {
        tracing::warn!("Failed to release {}: {}", name, e);
    }
}

/// Borrowed view of the processor for the duration of one run
pub(super) struct FrameLoop<'a> {
    pub config: &'a ProcessorConfig,
    pub backend: &'a dyn MediaBackend,
    pub engine: &'a mut SegmentationEngine,
    pub mode: &'a ModeSwitch,
    pub cancel: &'a CancelToken,
    pub stage: &'a mut PipelineStage,
    pub on_progress: &'a mut dyn FnMut(f32),
    pub on_debug: &'a mut dyn FnMut(&str),
}

/// Time spent in each per-frame stage since the last stats line
#[derive(Default)]
struct StageTimes {
    convert: Duration,
    segment: Duration,
    composite: Duration,
}

impl StageTimes {
    fn add(&mut self, other: &StageTimes) {
        self.convert += other.convert;
        self.segment += other.segment;
        self.composite += other.composite;
    }

    fn log(&self, frames: u64) {
        let avg = |d: Duration| d.as_secs_f64() * 1000.0 / STATS_INTERVAL as f64;
        let (convert_ms, segment_ms, composite_ms) = (avg(self.convert), avg(self.segment), avg(self.composite));
        let total_ms = convert_ms + segment_ms + composite_ms;
        tracing::info!(
            "Frame {}: convert={:.1}ms, segment={:.1}ms, composite={:.1}ms, total={:.1}ms, fps={:.1}",
            frames,
            convert_ms,
            segment_ms,
            composite_ms,
            total_ms,
            1000.0 / total_ms.max(f64::EPSILON)
        );
    }
}

#[derive(Default)]
struct Counters {
    decoded: u64,
    rendered: u64,
    failed: u64,
    muxed: u64,
}

impl FrameLoop<'_> {
    pub fn execute(mut self, input: &Path, output: &Path, compositor: Box<dyn Compositor>) -> Result<RunSummary> {
        let started = Instant::now();
        let mut resources = RunResources::default();
        resources.compositor = Some(compositor);

        let result = self.setup(input, output, &mut resources).and_then(|duration_us| {
            self.stage.transition_to(PipelineStage::Running)?;
            self.drive(&mut resources, duration_us)
        });

        // Finalizes the container before the run is reported as done
        resources.release_all();

        let counters = result.inspect_err(|_| {
            if !self.stage.is_terminal() {
                *self.stage = PipelineStage::Failed;
            }
        })?;
        if *self.stage == PipelineStage::Running {
            self.stage.transition_to(PipelineStage::Draining)?;
        }
        self.stage.transition_to(PipelineStage::Done)?;

        Ok(RunSummary {
            frames_decoded: counters.decoded,
            frames_rendered: counters.rendered,
            frames_failed: counters.failed,
            samples_muxed: counters.muxed,
            elapsed: started.elapsed(),
        })
    }

    /// Open the source, create encoder and muxer, bind the compositor
    fn setup(&mut self, input: &Path, output: &Path, resources: &mut RunResources) -> Result<i64> {
        self.stage.transition_to(PipelineStage::Initializing)?;

        let SourceMedia { demuxer, decoder } = self.backend.open_source(input)?;
        let info = demuxer.track_info().clone();
        resources.demuxer = Some(demuxer);
        resources.decoder = Some(decoder);
        tracing::info!(
            "Source video: {}x{} {} ({:.2}s)",
            info.width,
            info.height,
            info.codec_name,
            info.duration().as_secs_f64()
        );

        let encoder = self
            .backend
            .create_encoder(info.width, info.height, &self.config.encoder)?;
        let surface = encoder.input_surface();
        resources.encoder = Some(encoder);
        resources.muxer = Some(self.backend.create_muxer(output)?);

        if let Some(compositor) = resources.compositor.as_mut() {
            compositor
                .initialize(info.width, info.height, surface)
                .map_err(PipelineError::CompositorSetup)?;
            tracing::info!("Using {} compositor", compositor.name());
        }

        Ok(info.duration_us)
    }

    fn drive(&mut self, resources: &mut RunResources, duration_us: i64) -> Result<Counters> {
        let (Some(demuxer), Some(decoder), Some(encoder), Some(muxer), Some(compositor)) = (
            resources.demuxer.as_deref_mut(),
            resources.decoder.as_deref_mut(),
            resources.encoder.as_deref_mut(),
            resources.muxer.as_deref_mut(),
            resources.compositor.as_deref_mut(),
        ) else {
            return Err(PipelineError::NotInitialized);
        };

        let timeout = Duration::from_micros(self.config.poll_timeout_us);
        let mut progress = ProgressTracker::new(duration_us);
        let mut timestamps = MonotonicTimestamps::new();
        let mut counters = Counters::default();
        let mut track: Option<usize> = None;

        let mut input_done = false;
        let mut decoder_done = false;
        let mut encoder_eos_signaled = false;
        let mut stage_times = StageTimes::default();

        (self.on_debug)(&format!(
            "Processing started ({} mode, {} compositor)",
            self.mode.get(),
            compositor.name()
        ));

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Processing cancelled after {} frames", counters.decoded);
                return Err(PipelineError::Cancelled);
            }

            // Feed the decoder
            if !input_done && decoder.dequeue_input_slot(timeout)? {
                match demuxer.read_access_unit()? {
                    Some(unit) => {
                        let pts = unit.pts_us;
                        decoder.submit(unit)?;
                        if let Some(fraction) = progress.update(pts) {
                            (self.on_progress)(fraction);
                        }
                    }
                    None => {
                        decoder.signal_end_of_input()?;
                        input_done = true;
                        self.stage.transition_to(PipelineStage::Draining)?;
                        tracing::debug!("Decoder input exhausted");
                    }
                }
            }

            // Decoded frames
            if !decoder_done {
                if let Some(out) = decoder.poll_decoded(timeout)? {
                    if let Some(frame) = out.frame {
                        counters.decoded += 1;
                        let mut times = StageTimes::default();
                        let result =
                            self.process_frame(compositor, &frame, &mut timestamps, &mut times, counters.decoded);
                        // Hand the buffer back before the next poll, whatever happened
                        decoder.release_output(out.buffer_id)?;

                        match result {
                            Ok(debug_info) => {
                                counters.rendered += 1;
                                stage_times.add(&times);
                                if counters.rendered == 1 {
                                    (self.on_debug)(&format!("{}\n{}", debug_info, frame.layout_summary()));
                                }
                                if counters.rendered % STATS_INTERVAL == 0 {
                                    stage_times.log(counters.rendered);
                                    stage_times = StageTimes::default();
                                }
                            }
                            Err(FrameError::Compositor(source)) => {
                                tracing::error!("Frame {}: fatal compositor error: {}", counters.decoded, source);
                                (self.on_debug)(&format!("Frame {}: {}", counters.decoded, source));
                                return Err(PipelineError::Compositor {
                                    frame: counters.decoded,
                                    source,
                                });
                            }
                            Err(e) => {
                                counters.failed += 1;
                                tracing::warn!("Frame {}: {}", counters.decoded, e);
                                (self.on_debug)(&format!("Frame {}: {}", counters.decoded, e));
                            }
                        }
                    }

                    if out.end_of_stream {
                        decoder_done = true;
                        tracing::debug!("Decoder reached end of stream after {} frames", counters.decoded);
                    }
                }
            }

            if decoder_done && !encoder_eos_signaled {
                encoder.signal_end_of_input_stream()?;
                encoder_eos_signaled = true;
            }

            // Drain whatever the encoder has ready
            let mut encoder_done = false;
            while let Some(event) = encoder.poll_encoded(timeout)? {
                match event {
                    EncoderEvent::OutputFormat(format) => {
                        tracing::info!(
                            "Encoder output format: {} {}x{} @ {} fps",
                            format.mime_type,
                            format.width,
                            format.height,
                            format.frame_rate
                        );
                        track = Some(muxer.add_track(&format)?);
                        muxer.start()?;
                    }
                    EncoderEvent::Unit(unit) => {
                        if !unit.data.is_empty() {
                            let index = track.ok_or(CodecError::MuxerNotStarted)?;
                            muxer.write_sample(index, &unit)?;
                            counters.muxed += 1;
                        }
                        if unit.end_of_stream {
                            encoder_done = true;
                            break;
                        }
                    }
                }
            }

            if encoder_done {
                break;
            }
        }

        (self.on_debug)(&format!(
            "Processed {} frames ({} failed), muxed {} samples",
            counters.decoded, counters.failed, counters.muxed
        ));
        Ok(counters)
    }

    /// Convert, segment and composite one frame
    fn process_frame(
        &mut self,
        compositor: &mut dyn Compositor,
        frame: &YuvFrame,
        timestamps: &mut MonotonicTimestamps,
        times: &mut StageTimes,
        index: u64,
    ) -> std::result::Result<String, FrameError> {
        let _span = tracing::debug_span!("frame", index).entered();
        let timestamp_us = timestamps.next(frame.pts_us);

        let start = Instant::now();
        let rgb = frame_to_rgb(frame)?;
        times.convert = start.elapsed();

        let start = Instant::now();
        self.engine.set_mode(self.mode.get());
        let output = self.engine.segment(&rgb, timestamp_us)?;
        times.segment = start.elapsed();

        let start = Instant::now();
        let planes = frame.pack_planes()?;
        compositor.render_frame(&planes, &output.mask, timestamp_us)?;
        times.composite = start.elapsed();

        Ok(output.debug_info)
    }
}
