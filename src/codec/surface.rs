use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::CompositorError;

/// Frames an encoder surface holds before presenting fails
pub const DEFAULT_SURFACE_DEPTH: usize = 8;

/// One rendered RGBA frame with its presentation timestamp
#[derive(Debug, Clone)]
pub struct SurfaceFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, `width * height * 4` bytes
    pub rgba: Vec<u8>,
    pub timestamp_us: i64,
}

/// Producer side of an encoder's input surface
///
/// The compositor renders into it; the encoder owns the matching
/// [`SurfaceReceiver`]. Presenting never blocks: a full surface is an error,
/// since the orchestrator drains the encoder every iteration.
#[derive(Debug, Clone)]
pub struct EncoderSurface {
    tx: Sender<SurfaceFrame>,
}

/// Consumer side of an encoder's input surface
#[derive(Debug)]
pub struct SurfaceReceiver {
    rx: Receiver<SurfaceFrame>,
}

impl EncoderSurface {
    pub fn channel(depth: usize) -> (EncoderSurface, SurfaceReceiver) {
        let (tx, rx) = bounded(depth.max(1));
        (EncoderSurface { tx }, SurfaceReceiver { rx })
    }

    /// Hand a rendered frame to the encoder, timestamp attached
    pub fn present(&self, frame: SurfaceFrame) -> Result<(), CompositorError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => CompositorError::SurfaceFull,
            TrySendError::Disconnected(_) => CompositorError::SurfaceClosed,
        })
    }
}

impl SurfaceReceiver {
    /// Next presented frame, if any
    pub fn try_next(&self) -> Option<SurfaceFrame> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
