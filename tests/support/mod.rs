//! In-memory codec doubles for driving the pipeline without FFmpeg or a GPU

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backdrop::codec::{
    AccessUnit, Demuxer, DecoderOutput, EncodedUnit, EncoderEvent, EncoderSurface, Muxer, OutputFormat,
    SurfaceReceiver, VideoDecoder, VideoEncoder, VideoTrackInfo, DEFAULT_SURFACE_DEPTH,
};
use backdrop::compositor::{Compositor, CompositorSettings, CpuCompositor};
use backdrop::config::EncoderSettings;
use backdrop::frame::{PackedPlanes, Plane, SegmentationMask, YuvFrame};
use backdrop::segmentation::{SegmentationOutput, SegmentationStrategy};
use backdrop::{
    CodecError, CompositorError, MediaBackend, ProcessorConfig, SegmentationEngine, SegmentationError,
    SegmentationMode, SourceMedia, VideoProcessor,
};
use bytes::Bytes;
use image::RgbImage;

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;
pub const FRAME_COUNT: usize = 90;
pub const FRAME_INTERVAL_US: i64 = 33_333;
pub const DURATION_US: i64 = 3_000_000;
pub const POOL_SIZE: usize = 4;

/// Shared, ordered record of lifecycle events
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Events starting with `release:`, prefix stripped
    pub fn releases(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("release:").map(str::to_string))
            .collect()
    }
}

// ---- demuxer ----

pub struct SyntheticDemuxer {
    info: VideoTrackInfo,
    pts: VecDeque<i64>,
    log: EventLog,
}

impl Demuxer for SyntheticDemuxer {
    fn track_info(&self) -> &VideoTrackInfo {
        &self.info
    }

    fn read_access_unit(&mut self) -> Result<Option<AccessUnit>, CodecError> {
        Ok(self.pts.pop_front().map(|pts_us| AccessUnit {
            data: Bytes::from_static(&[0, 0, 0, 1]),
            pts_us,
            keyframe: pts_us == 0,
        }))
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.log.push("release:demuxer");
        Ok(())
    }
}

// ---- decoder ----

#[derive(Default)]
pub struct DecoderStats {
    pub max_outstanding: usize,
    pub released_buffers: usize,
}

/// Decodes instantly; refuses input while its pool is full
pub struct SyntheticDecoder {
    ready: VecDeque<(u64, YuvFrame)>,
    outstanding: HashSet<u64>,
    next_id: u64,
    input_ended: bool,
    eos_emitted: bool,
    fail_release: bool,
    stats: Arc<Mutex<DecoderStats>>,
    log: EventLog,
}

/// 4:2:0 frame with padded rows and NV12-style interleaved chroma
pub fn synthetic_frame(pts_us: i64) -> YuvFrame {
    let stride = WIDTH as usize + 8;
    let mut y = vec![0u8; stride * HEIGHT as usize];
    for row in 0..HEIGHT as usize {
        for col in 0..WIDTH as usize {
            y[row * stride + col] = (16 + (row * WIDTH as usize + col) % 200) as u8;
        }
    }

    let chroma_rows = HEIGHT as usize / 2;
    let uv = Bytes::from(vec![128u8; stride * chroma_rows]);

    YuvFrame {
        width: WIDTH,
        height: HEIGHT,
        y: Plane {
            data: Bytes::from(y),
            row_stride: stride,
            pixel_stride: 1,
        },
        u: Plane {
            data: uv.clone(),
            row_stride: stride,
            pixel_stride: 2,
        },
        v: Plane {
            data: uv.slice(1..),
            row_stride: stride,
            pixel_stride: 2,
        },
        pts_us,
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<bool, CodecError> {
        Ok(!self.input_ended && self.ready.len() + self.outstanding.len() < POOL_SIZE)
    }

    fn submit(&mut self, unit: AccessUnit) -> Result<(), CodecError> {
        let id = self.next_id;
        self.next_id += 1;
        self.ready.push_back((id, synthetic_frame(unit.pts_us)));
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.input_ended = true;
        Ok(())
    }

    fn poll_decoded(&mut self, _timeout: Duration) -> Result<Option<DecoderOutput>, CodecError> {
        if let Some((buffer_id, frame)) = self.ready.pop_front() {
            self.outstanding.insert(buffer_id);
            let mut stats = self.stats.lock().unwrap();
            stats.max_outstanding = stats.max_outstanding.max(self.outstanding.len());
            return Ok(Some(DecoderOutput {
                buffer_id,
                frame: Some(frame),
                end_of_stream: false,
            }));
        }
        if self.input_ended && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(Some(DecoderOutput {
                buffer_id: u64::MAX,
                frame: None,
                end_of_stream: true,
            }));
        }
        Ok(None)
    }

    fn release_output(&mut self, buffer_id: u64) -> Result<(), CodecError> {
        if !self.outstanding.remove(&buffer_id) {
            return Err(CodecError::UnknownBuffer(buffer_id));
        }
        self.stats.lock().unwrap().released_buffers += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.log.push("release:decoder");
        if self.fail_release {
            return Err(CodecError::Decode("decoder stuck".to_string()));
        }
        Ok(())
    }
}

// ---- encoder ----

/// Turns every presented surface frame into one access unit
pub struct RecordingEncoder {
    surface: EncoderSurface,
    receiver: SurfaceReceiver,
    format_sent: bool,
    unit_before_format: bool,
    input_ended: bool,
    eos_sent: bool,
    settings: EncoderSettings,
    width: u32,
    height: u32,
    presented: Arc<Mutex<Vec<i64>>>,
    log: EventLog,
}

impl VideoEncoder for RecordingEncoder {
    fn input_surface(&self) -> EncoderSurface {
        self.surface.clone()
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        self.input_ended = true;
        Ok(())
    }

    fn poll_encoded(&mut self, _timeout: Duration) -> Result<Option<EncoderEvent>, CodecError> {
        if self.eos_sent {
            return Ok(None);
        }
        if !self.format_sent && !self.unit_before_format {
            self.format_sent = true;
            return Ok(Some(EncoderEvent::OutputFormat(OutputFormat {
                mime_type: EncoderSettings::MIME_TYPE.to_string(),
                width: self.width,
                height: self.height,
                frame_rate: self.settings.frame_rate,
                bit_rate: self.settings.bit_rate,
                codec_config: vec![0, 0, 0, 1, 0x67],
            })));
        }
        if let Some(frame) = self.receiver.try_next() {
            self.presented.lock().unwrap().push(frame.timestamp_us);
            return Ok(Some(EncoderEvent::Unit(EncodedUnit {
                data: Bytes::from(vec![0u8; 8]),
                pts_us: frame.timestamp_us,
                dts_us: frame.timestamp_us,
                keyframe: false,
                end_of_stream: false,
            })));
        }
        if self.input_ended {
            self.eos_sent = true;
            return Ok(Some(EncoderEvent::Unit(EncodedUnit {
                data: Bytes::new(),
                pts_us: 0,
                dts_us: 0,
                keyframe: false,
                end_of_stream: true,
            })));
        }
        Ok(None)
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.log.push("release:encoder");
        Ok(())
    }
}

// ---- muxer ----

#[derive(Default)]
pub struct MuxState {
    pub tracks: Vec<OutputFormat>,
    pub started: bool,
    pub finalized: bool,
    pub samples: Vec<i64>,
}

impl MuxState {
    /// Track duration as the span of sample timestamps plus one frame
    pub fn duration_us(&self) -> i64 {
        match (self.samples.iter().min(), self.samples.iter().max()) {
            (Some(first), Some(last)) => last - first + FRAME_INTERVAL_US,
            _ => 0,
        }
    }
}

pub struct MemoryMuxer {
    state: Arc<Mutex<MuxState>>,
    log: EventLog,
}

impl MemoryMuxer {
    pub fn new(state: Arc<Mutex<MuxState>>, log: EventLog) -> Self {
        Self { state, log }
    }
}

impl Muxer for MemoryMuxer {
    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, CodecError> {
        let mut state = self.state.lock().unwrap();
        state.tracks.push(format.clone());
        Ok(state.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, unit: &EncodedUnit) -> Result<(), CodecError> {
        let mut state = self.state.lock().unwrap();
        if !state.started || track >= state.tracks.len() {
            return Err(CodecError::MuxerNotStarted);
        }
        state.samples.push(unit.pts_us);
        Ok(())
    }

    fn release(&mut self) -> Result<(), CodecError> {
        self.log.push("release:muxer");
        let mut state = self.state.lock().unwrap();
        if state.started {
            state.finalized = true;
        }
        Ok(())
    }
}

// ---- backend ----

/// Media backend producing the synthetic components above
#[derive(Clone)]
pub struct SyntheticBackend {
    pub pts: Vec<i64>,
    pub duration_us: i64,
    pub unit_before_format: bool,
    pub fail_decoder_release: bool,
    pub log: EventLog,
    pub mux: Arc<Mutex<MuxState>>,
    pub decoder_stats: Arc<Mutex<DecoderStats>>,
    pub presented: Arc<Mutex<Vec<i64>>>,
}

impl SyntheticBackend {
    /// 3-second, 90-frame source at 30 fps
    pub fn new() -> Self {
        Self {
            pts: (0..FRAME_COUNT as i64).map(|i| i * FRAME_INTERVAL_US).collect(),
            duration_us: DURATION_US,
            unit_before_format: false,
            fail_decoder_release: false,
            log: EventLog::default(),
            mux: Arc::default(),
            decoder_stats: Arc::default(),
            presented: Arc::default(),
        }
    }

    pub fn with_pts(mut self, pts: Vec<i64>) -> Self {
        self.pts = pts;
        self
    }

    /// Fresh muxer state for the next run
    pub fn reset_outputs(&self) {
        *self.mux.lock().unwrap() = MuxState::default();
        self.presented.lock().unwrap().clear();
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_source(&self, input: &Path) -> Result<SourceMedia, CodecError> {
        self.log.push(format!("open:{}", input.display()));
        let demuxer = SyntheticDemuxer {
            info: VideoTrackInfo {
                width: WIDTH,
                height: HEIGHT,
                duration_us: self.duration_us,
                frame_rate: Some(30.0),
                codec_name: "synthetic".to_string(),
            },
            pts: self.pts.iter().copied().collect(),
            log: self.log.clone(),
        };
        let decoder = SyntheticDecoder {
            ready: VecDeque::new(),
            outstanding: HashSet::new(),
            next_id: 0,
            input_ended: false,
            eos_emitted: false,
            fail_release: self.fail_decoder_release,
            stats: self.decoder_stats.clone(),
            log: self.log.clone(),
        };
        Ok(SourceMedia {
            demuxer: Box::new(demuxer),
            decoder: Box::new(decoder),
        })
    }

    fn create_encoder(
        &self,
        width: u32,
        height: u32,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn VideoEncoder>, CodecError> {
        let (surface, receiver) = EncoderSurface::channel(DEFAULT_SURFACE_DEPTH);
        Ok(Box::new(RecordingEncoder {
            surface,
            receiver,
            format_sent: false,
            unit_before_format: self.unit_before_format,
            input_ended: false,
            eos_sent: false,
            settings: *settings,
            width,
            height,
            presented: self.presented.clone(),
            log: self.log.clone(),
        }))
    }

    fn create_muxer(&self, _output: &Path) -> Result<Box<dyn Muxer>, CodecError> {
        Ok(Box::new(MemoryMuxer::new(self.mux.clone(), self.log.clone())))
    }
}

// ---- segmentation ----

#[derive(Default)]
pub struct StrategyRecord {
    pub calls: usize,
    pub resets: usize,
    pub timestamps: Vec<i64>,
}

/// Constant-mask strategy that can fail on a chosen call
pub struct ScriptedStrategy {
    pub mode: SegmentationMode,
    pub fail_on_call: Option<usize>,
    pub record: Arc<Mutex<StrategyRecord>>,
}

impl SegmentationStrategy for ScriptedStrategy {
    fn segment(&mut self, frame: &RgbImage, timestamp_us: i64) -> Result<SegmentationOutput, SegmentationError> {
        let mut record = self.record.lock().unwrap();
        record.calls += 1;
        record.timestamps.push(timestamp_us);
        if Some(record.calls) == self.fail_on_call {
            return Err(SegmentationError::Inference("scripted failure".to_string()));
        }
        assert_eq!(frame.dimensions(), (WIDTH, HEIGHT));
        Ok(SegmentationOutput {
            mask: SegmentationMask::new(8, 6, vec![0.75; 48]),
            debug_info: format!("{} call {}", self.mode, record.calls),
        })
    }

    fn reset_state(&mut self) {
        self.record.lock().unwrap().resets += 1;
    }

    fn input_size(&self) -> (u32, u32) {
        (8, 6)
    }

    fn mode(&self) -> SegmentationMode {
        self.mode
    }
}

/// Engine with scripted strategies for both modes
pub fn scripted_engine(
    mode: SegmentationMode,
    person_fail_on: Option<usize>,
) -> (SegmentationEngine, Arc<Mutex<StrategyRecord>>, Arc<Mutex<StrategyRecord>>) {
    let person = Arc::new(Mutex::new(StrategyRecord::default()));
    let objects = Arc::new(Mutex::new(StrategyRecord::default()));
    let engine = SegmentationEngine::new(mode)
        .with_strategy(Box::new(ScriptedStrategy {
            mode: SegmentationMode::PersonOnly,
            fail_on_call: person_fail_on,
            record: person.clone(),
        }))
        .with_strategy(Box::new(ScriptedStrategy {
            mode: SegmentationMode::AllObjects,
            fail_on_call: None,
            record: objects.clone(),
        }));
    (engine, person, objects)
}

// ---- compositors ----

/// CPU compositor that logs its release and can fail on a chosen frame
pub struct LoggingCompositor {
    inner: CpuCompositor,
    fail_on_frame: Option<usize>,
    frames: usize,
    log: EventLog,
}

impl LoggingCompositor {
    pub fn new(settings: CompositorSettings, fail_on_frame: Option<usize>, log: EventLog) -> Self {
        Self {
            inner: CpuCompositor::new(settings),
            fail_on_frame,
            frames: 0,
            log,
        }
    }
}

impl Compositor for LoggingCompositor {
    fn initialize(&mut self, width: u32, height: u32, surface: EncoderSurface) -> Result<(), CompositorError> {
        self.inner.initialize(width, height, surface)
    }

    fn render_frame(
        &mut self,
        planes: &PackedPlanes,
        mask: &SegmentationMask,
        timestamp_us: i64,
    ) -> Result<(), CompositorError> {
        self.frames += 1;
        if Some(self.frames) == self.fail_on_frame {
            return Err(CompositorError::Gpu {
                operation: "render",
                message: "device lost".to_string(),
            });
        }
        self.inner.render_frame(planes, mask, timestamp_us)
    }

    fn release(&mut self) {
        self.log.push("release:compositor");
        self.inner.release();
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

pub fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        cpu_composite: true,
        poll_timeout_us: 0,
        ..ProcessorConfig::default()
    }
}

/// Processor wired to `backend`, a scripted engine and a logging compositor
pub fn processor(
    backend: &SyntheticBackend,
    engine: SegmentationEngine,
    fail_compositor_on: Option<usize>,
) -> VideoProcessor {
    let log = backend.log.clone();
    VideoProcessor::with_engine(test_config(), Box::new(backend.clone()), engine)
        .unwrap()
        .with_compositor_factory(move |settings| -> Box<dyn Compositor> {
            Box::new(LoggingCompositor::new(settings, fail_compositor_on, log.clone()))
        })
}
