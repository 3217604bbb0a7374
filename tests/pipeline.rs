//! End-to-end runs of the processing loop over synthetic codecs

mod support;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use backdrop::{spawn_processing, CodecError, PipelineError, PipelineStage, SegmentationMode};
use support::*;

fn run(processor: &mut backdrop::VideoProcessor) -> (Result<backdrop::RunSummary, PipelineError>, Vec<f32>, Vec<String>) {
    let mut progress = Vec::new();
    let mut debug = Vec::new();
    let result = processor.process_video(
        Path::new("synthetic.mp4"),
        Path::new("out.mp4"),
        &mut |p| progress.push(p),
        &mut |m| debug.push(m.to_string()),
    );
    (result, progress, debug)
}

#[test]
fn test_ninety_frames_end_to_end() {
    let backend = SyntheticBackend::new();
    let (engine, person, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    let (result, _, debug) = run(&mut processor);
    let summary = result.unwrap();

    assert_eq!(summary.frames_decoded, FRAME_COUNT as u64);
    assert_eq!(summary.frames_rendered, FRAME_COUNT as u64);
    assert_eq!(summary.frames_failed, 0);
    assert_eq!(summary.samples_muxed, FRAME_COUNT as u64);
    assert_eq!(processor.stage(), PipelineStage::Done);

    let mux = backend.mux.lock().unwrap();
    assert_eq!(mux.tracks.len(), 1);
    assert_eq!(mux.tracks[0].width, WIDTH);
    assert!(mux.finalized);
    assert_eq!(mux.samples.len(), FRAME_COUNT);
    assert!((mux.duration_us() - DURATION_US).abs() <= FRAME_INTERVAL_US);

    let stats = backend.decoder_stats.lock().unwrap();
    assert!(stats.max_outstanding <= POOL_SIZE);
    assert_eq!(stats.released_buffers, FRAME_COUNT);

    assert_eq!(person.lock().unwrap().calls, FRAME_COUNT);
    assert!(!debug.is_empty());
    assert!(debug.iter().any(|m| m.contains("Y: stride=40")));
}

#[test]
fn test_bad_frame_is_skipped() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, Some(5));
    let mut processor = processor(&backend, engine, None);

    let (result, _, debug) = run(&mut processor);
    let summary = result.unwrap();

    assert_eq!(summary.frames_decoded, FRAME_COUNT as u64);
    assert_eq!(summary.frames_failed, 1);
    assert_eq!(summary.frames_rendered, FRAME_COUNT as u64 - 1);
    assert_eq!(summary.samples_muxed, FRAME_COUNT as u64 - 1);
    assert!(debug.iter().any(|m| m.starts_with("Frame 5:") && m.contains("scripted failure")));
    assert_eq!(backend.decoder_stats.lock().unwrap().released_buffers, FRAME_COUNT);
}

#[test]
fn test_progress_is_monotonic_and_bounded() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    let (result, progress, _) = run(&mut processor);
    result.unwrap();

    assert!(!progress.is_empty());
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(progress.windows(2).all(|w| w[1] >= w[0]));
    assert!(*progress.last().unwrap() > 0.95);
}

#[test]
fn test_presented_timestamps_strictly_increase() {
    // Repeated and reordered source timestamps
    let pts = vec![0, 0, 66_666, 33_333, 33_333, 100_000, 100_000];
    let backend = SyntheticBackend::new().with_pts(pts.clone());
    let (engine, person, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    let (result, _, _) = run(&mut processor);
    assert_eq!(result.unwrap().samples_muxed, pts.len() as u64);

    let presented = backend.presented.lock().unwrap().clone();
    assert_eq!(presented, vec![0, 1, 66_666, 66_667, 66_668, 100_000, 100_001]);
    assert_eq!(person.lock().unwrap().timestamps, presented);
}

#[test]
fn test_cancel_releases_in_order() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);
    let cancel = processor.cancel_token();

    let result = processor.process_video(
        Path::new("synthetic.mp4"),
        Path::new("out.mp4"),
        &mut |p| {
            if p > 0.3 {
                cancel.cancel();
            }
        },
        &mut |_| {},
    );

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(processor.stage(), PipelineStage::Failed);
    assert_eq!(
        backend.log.releases(),
        vec!["compositor", "demuxer", "decoder", "encoder", "muxer"]
    );
    assert!((backend.mux.lock().unwrap().samples.len()) < FRAME_COUNT);
    // The token is cleared so the processor can run again
    assert!(!processor.cancel_token().is_cancelled());
}

#[test]
fn test_failed_release_does_not_skip_others() {
    let backend = SyntheticBackend {
        fail_decoder_release: true,
        ..SyntheticBackend::new()
    };
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    let (result, _, _) = run(&mut processor);
    result.unwrap();
    assert_eq!(
        backend.log.releases(),
        vec!["compositor", "demuxer", "decoder", "encoder", "muxer"]
    );
}

#[test]
fn test_state_reset_between_runs() {
    let backend = SyntheticBackend::new().with_pts(vec![0, 33_333, 66_666]);
    let (engine, person, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    run(&mut processor).0.unwrap();
    backend.reset_outputs();
    run(&mut processor).0.unwrap();

    let record = person.lock().unwrap();
    assert_eq!(record.resets, 2);
    assert_eq!(record.timestamps, vec![0, 33_333, 66_666, 0, 33_333, 66_666]);
    assert_eq!(processor.stage(), PipelineStage::Done);
}

#[test]
fn test_run_after_cancel_succeeds() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    processor.cancel_token().cancel();
    assert!(matches!(run(&mut processor).0, Err(PipelineError::Cancelled)));

    backend.reset_outputs();
    let summary = run(&mut processor).0.unwrap();
    assert_eq!(summary.samples_muxed, FRAME_COUNT as u64);
}

#[test]
fn test_mode_switch_mid_run() {
    let backend = SyntheticBackend::new();
    let (engine, person, objects) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);
    let switch = processor.mode_switch();

    let result = processor.process_video(
        Path::new("synthetic.mp4"),
        Path::new("out.mp4"),
        &mut |p| {
            if p >= 0.5 {
                switch.set(SegmentationMode::AllObjects);
            }
        },
        &mut |_| {},
    );
    assert_eq!(result.unwrap().frames_rendered, FRAME_COUNT as u64);

    let person_calls = person.lock().unwrap().calls;
    let objects_calls = objects.lock().unwrap().calls;
    assert!(person_calls > 0 && objects_calls > 0);
    assert_eq!(person_calls + objects_calls, FRAME_COUNT);
    assert_eq!(processor.segmentation_mode(), SegmentationMode::AllObjects);
}

#[test]
fn test_compositor_error_is_fatal() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, Some(3));

    let (result, _, debug) = run(&mut processor);
    assert!(matches!(result, Err(PipelineError::Compositor { frame: 3, .. })));
    assert_eq!(processor.stage(), PipelineStage::Failed);
    assert!(debug.iter().any(|m| m.starts_with("Frame 3:")));
    assert_eq!(backend.log.releases().len(), 5);
}

#[test]
fn test_unit_before_output_format_fails() {
    let backend = SyntheticBackend {
        unit_before_format: true,
        ..SyntheticBackend::new()
    };
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let mut processor = processor(&backend, engine, None);

    let (result, _, _) = run(&mut processor);
    assert!(matches!(result, Err(PipelineError::Codec(CodecError::MuxerNotStarted))));
    assert!(!backend.mux.lock().unwrap().finalized);
}

#[test]
fn test_missing_strategy_skips_every_frame() {
    let backend = SyntheticBackend::new().with_pts(vec![0, 33_333]);
    let engine = backdrop::SegmentationEngine::new(SegmentationMode::AllObjects);
    let mut processor = processor(&backend, engine, None);

    let (result, _, debug) = run(&mut processor);
    let summary = result.unwrap();
    assert_eq!(summary.frames_failed, 2);
    assert_eq!(summary.samples_muxed, 0);
    assert!(debug.iter().any(|m| m.contains("no strategy configured")));
}

#[test]
fn test_background_worker() {
    let backend = SyntheticBackend::new();
    let (engine, _, _) = scripted_engine(SegmentationMode::PersonOnly, None);
    let processor = processor(&backend, engine, None);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    let handle = spawn_processing(
        processor,
        PathBuf::from("synthetic.mp4"),
        PathBuf::from("out.mp4"),
        move |p| sink.lock().unwrap().push(p),
        |_| {},
    )
    .unwrap();

    let summary = handle.join().unwrap();
    assert_eq!(summary.samples_muxed, FRAME_COUNT as u64);
    assert!(!progress.lock().unwrap().is_empty());
}
