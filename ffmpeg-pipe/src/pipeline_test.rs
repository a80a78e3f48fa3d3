// ============================================================================
// Pipeline orchestration tests
// ============================================================================

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{Pipeline, PipelineConfig, PipelineState};
use crate::{
    bridge::BridgeOptions,
    decoder::{DecodeSettings, DecodeStage, FfmpegDecoder},
    encoder::{EncodeSettings, EncodeStage, FfmpegEncoder},
    error::{PipelineError, Stage},
    frame::Frame,
    geometry::{PixelFormat, StreamGeometry},
    metadata::{FixedGeometry, SourceProbe},
    process::{
        CommandSpec, CompletionSignal, PipeReader, PipeWriter, ProcessSupervisor, StageContext,
    },
    transform::FrameTransform,
};

// ------------------------------------------------------------------------
// Fake stages
// ------------------------------------------------------------------------

fn geometry() -> StreamGeometry {
    StreamGeometry::new(2, 2, PixelFormat::Rgb565le).unwrap()
}

fn probe() -> Arc<dyn SourceProbe> {
    Arc::new(FixedGeometry(geometry()))
}

/// Frame `i` is filled with byte `i + 1`.
fn synthetic_frames(count: u8) -> Vec<u8> {
    (0..count)
        .flat_map(|i| vec![i + 1; geometry().frame_len()])
        .collect()
}

fn runtime_failure(stage: Stage) -> PipelineError {
    PipelineError::ProcessRuntime {
        stage,
        program: "fake".to_string(),
        code: Some(1),
    }
}

struct BrokenProbe;

impl SourceProbe for BrokenProbe {
    fn probe(&self, source: &str) -> Result<StreamGeometry, PipelineError> {
        Err(PipelineError::Probe {
            source_id: source.to_string(),
            reason: "no video stream".to_string(),
        })
    }
}

/// Emits `data`, then keeps the pipe open until cancelled if `hold_open`,
/// then reports `outcome` after `delay`.
struct FakeDecoder {
    data: Vec<u8>,
    hold_open: bool,
    delay: Duration,
    outcome: fn() -> Result<(), PipelineError>,
}

impl FakeDecoder {
    fn emitting(data: Vec<u8>) -> Self {
        Self {
            data,
            hold_open: false,
            delay: Duration::ZERO,
            outcome: || Ok(()),
        }
    }
}

impl DecodeStage for FakeDecoder {
    fn start(&self, ctx: &StageContext) -> Result<(PipeReader, CompletionSignal), PipelineError> {
        let (mut ours, theirs) = tokio::io::duplex(ctx.pipe_capacity);
        let (sender, signal) = CompletionSignal::channel(Stage::Decode);
        let data = self.data.clone();
        let hold_open = self.hold_open;
        let delay = self.delay;
        let outcome = self.outcome;
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let written = ours.write_all(&data).await;
            if hold_open {
                cancel.cancelled().await;
            }
            drop(ours);
            tokio::time::sleep(delay).await;
            let result = match written {
                Err(source) if !cancel.is_cancelled() => Err(PipelineError::Io {
                    stage: Stage::Decode,
                    source,
                }),
                _ => outcome(),
            };
            sender.complete(result);
        });
        Ok((Box::new(theirs), signal))
    }
}

struct LaunchFailure;

impl DecodeStage for LaunchFailure {
    fn start(&self, _ctx: &StageContext) -> Result<(PipeReader, CompletionSignal), PipelineError> {
        Err(PipelineError::ProcessLaunch {
            stage: Stage::Decode,
            program: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

/// Collects everything written to it, then reports `outcome` after `delay`.
#[derive(Clone)]
struct FakeEncoder {
    received: Arc<Mutex<Vec<u8>>>,
    started: Arc<AtomicBool>,
    /// Stop reading immediately, as a crashed encoder would.
    refuse_input: bool,
    delay: Duration,
    outcome: fn() -> Result<(), PipelineError>,
}

impl FakeEncoder {
    fn new() -> Self {
        Self {
            received: Arc::default(),
            started: Arc::default(),
            refuse_input: false,
            delay: Duration::ZERO,
            outcome: || Ok(()),
        }
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    fn frames(&self) -> Vec<Frame> {
        self.received()
            .chunks(geometry().frame_len())
            .enumerate()
            .map(|(i, chunk)| Frame::new(i as u64, chunk))
            .collect()
    }
}

impl EncodeStage for FakeEncoder {
    fn start(&self, ctx: &StageContext) -> Result<(PipeWriter, CompletionSignal), PipelineError> {
        self.started.store(true, Ordering::SeqCst);
        let (theirs, mut ours) = tokio::io::duplex(ctx.pipe_capacity);
        let (sender, signal) = CompletionSignal::channel(Stage::Encode);
        let received = Arc::clone(&self.received);
        let refuse_input = self.refuse_input;
        let delay = self.delay;
        let outcome = self.outcome;
        tokio::spawn(async move {
            if refuse_input {
                drop(ours);
            } else {
                let mut buf = Vec::new();
                let _ = ours.read_to_end(&mut buf).await;
                received.lock().unwrap().extend_from_slice(&buf);
                drop(ours);
            }
            tokio::time::sleep(delay).await;
            sender.complete(outcome());
        });
        Ok((Box::new(theirs), signal))
    }
}

/// Never reads its input; lets go of it only once the run is stopped.
struct StalledEncoder;

impl EncodeStage for StalledEncoder {
    fn start(&self, ctx: &StageContext) -> Result<(PipeWriter, CompletionSignal), PipelineError> {
        let (theirs, ours) = tokio::io::duplex(ctx.pipe_capacity);
        let (sender, signal) = CompletionSignal::channel(Stage::Encode);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(ours);
            sender.complete(Ok(()));
        });
        Ok((Box::new(theirs), signal))
    }
}

/// Appends a byte to every frame.
struct Grow;

impl FrameTransform for Grow {
    fn name(&self) -> &str {
        "grow"
    }

    fn apply(&mut self, frame: Frame) -> Result<Frame, PipelineError> {
        let mut data = frame.data().to_vec();
        data.push(0);
        Ok(Frame::new(frame.seq(), data))
    }
}

struct Invert;

impl FrameTransform for Invert {
    fn name(&self) -> &str {
        "invert"
    }

    fn apply(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        for b in frame.data_mut() {
            *b = !*b;
        }
        Ok(frame)
    }
}

fn pipeline(decoder: impl DecodeStage + 'static, encoder: &FakeEncoder) -> Pipeline {
    Pipeline::new(
        PipelineConfig::new("synthetic"),
        probe(),
        Box::new(decoder),
        Box::new(encoder.clone()),
    )
}

// ------------------------------------------------------------------------
// Scenarios
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_two_frame_end_to_end() -> anyhow::Result<()> {
    let source = synthetic_frames(2);
    assert_eq!(source.len(), 16);
    let encoder = FakeEncoder::new();

    let pipe = pipeline(FakeDecoder::emitting(source.clone()), &encoder);
    let state = pipe.subscribe_state();
    let report = pipe.run().await?;

    assert_eq!(report.frames, 2);
    assert_eq!(report.bytes, 16);
    assert_eq!(report.geometry, geometry());
    assert!(!report.stopped_early);
    assert_eq!(encoder.received(), source);
    assert_eq!(encoder.frames().len(), 2);
    assert_eq!(
        *state.borrow(),
        PipelineState::Completed { success: true }
    );
    Ok(())
}

#[tokio::test]
async fn test_many_frames_keep_order() -> anyhow::Result<()> {
    let source = synthetic_frames(50);
    let encoder = FakeEncoder::new();

    pipeline(FakeDecoder::emitting(source.clone()), &encoder)
        .run()
        .await?;

    let frames = encoder.frames();
    assert_eq!(frames.len(), 50);
    for (i, frame) in frames.iter().enumerate() {
        assert!(frame.data().iter().all(|&b| b == i as u8 + 1));
    }
    Ok(())
}

#[tokio::test]
async fn test_transform_runs_between_stages() -> anyhow::Result<()> {
    let encoder = FakeEncoder::new();

    pipeline(FakeDecoder::emitting(synthetic_frames(3)), &encoder)
        .with_transform(Box::new(Invert))
        .run()
        .await?;

    let expected: Vec<u8> = synthetic_frames(3).iter().map(|b| !b).collect();
    assert_eq!(encoder.received(), expected);
    Ok(())
}

#[tokio::test]
async fn test_transform_built_from_probed_geometry() -> anyhow::Result<()> {
    let encoder = FakeEncoder::new();
    let seen = Arc::new(Mutex::new(None));
    let seen_by_factory = Arc::clone(&seen);

    pipeline(FakeDecoder::emitting(synthetic_frames(1)), &encoder)
        .with_transform_factory(move |geometry| {
            *seen_by_factory.lock().unwrap() = Some(*geometry);
            let transform: Box<dyn FrameTransform> = Box::new(Invert);
            Ok(transform)
        })
        .run()
        .await?;

    assert_eq!(*seen.lock().unwrap(), Some(geometry()));
    Ok(())
}

#[tokio::test]
async fn test_transform_init_failure_starts_nothing() {
    let encoder = FakeEncoder::new();

    let err = pipeline(LaunchFailure, &encoder)
        .with_transform_factory(|_| {
            Err(PipelineError::TransformInit {
                reason: "missing model".to_string(),
            })
        })
        .run()
        .await
        .unwrap_err();

    // the decoder would have failed to launch; the factory runs first
    assert!(matches!(err, PipelineError::TransformInit { .. }));
    assert!(!encoder.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_probe_failure_starts_nothing() {
    let encoder = FakeEncoder::new();
    let pipe = Pipeline::new(
        PipelineConfig::new("missing.mp4"),
        Arc::new(BrokenProbe),
        Box::new(FakeDecoder::emitting(Vec::new())),
        Box::new(encoder.clone()),
    );

    let err = pipe.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Probe { .. }));
    assert_eq!(err.stage(), Stage::Probe);
    assert!(!encoder.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_decoder_launch_failure_skips_encoder() {
    let encoder = FakeEncoder::new();

    let err = pipeline(LaunchFailure, &encoder).run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ProcessLaunch {
            stage: Stage::Decode,
            ..
        }
    ));
    assert!(!encoder.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_bad_source_identifier_fails_launch() {
    let encoder = FakeEncoder::new();
    let decoder = FfmpegDecoder::new(DecodeSettings::new(""));

    let err = pipeline(decoder, &encoder).run().await.unwrap_err();

    assert!(matches!(err, PipelineError::ProcessLaunch { .. }));
    assert_eq!(err.stage(), Stage::Decode);
    assert!(!encoder.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_encoder_launch_failure_stops_decoder() {
    let decoder = FakeDecoder {
        hold_open: true,
        ..FakeDecoder::emitting(synthetic_frames(1))
    };
    let encoder = FfmpegEncoder::new(EncodeSettings::new(""));
    let pipe = Pipeline::new(
        PipelineConfig::new("synthetic"),
        probe(),
        Box::new(decoder),
        Box::new(encoder),
    );

    let err = tokio::time::timeout(Duration::from_secs(5), pipe.run())
        .await
        .expect("pipeline hung")
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ProcessLaunch {
            stage: Stage::Encode,
            ..
        }
    ));
}

#[tokio::test]
async fn test_late_encoder_failure_wins() {
    let encoder = FakeEncoder {
        delay: Duration::from_millis(50),
        outcome: || Err(runtime_failure(Stage::Encode)),
        ..FakeEncoder::new()
    };

    let err = pipeline(FakeDecoder::emitting(synthetic_frames(2)), &encoder)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ProcessRuntime {
            stage: Stage::Encode,
            ..
        }
    ));
}

#[tokio::test]
async fn test_first_root_cause_wins() {
    let decoder = FakeDecoder {
        outcome: || Err(runtime_failure(Stage::Decode)),
        ..FakeDecoder::emitting(Vec::new())
    };
    let encoder = FakeEncoder {
        outcome: || Err(runtime_failure(Stage::Encode)),
        ..FakeEncoder::new()
    };

    let err = pipeline(decoder, &encoder).run().await.unwrap_err();

    assert_eq!(err.stage(), Stage::Decode);
}

#[tokio::test]
async fn test_crashed_encoder_outranks_broken_pipe() {
    let encoder = FakeEncoder {
        refuse_input: true,
        delay: Duration::from_millis(50),
        outcome: || Err(runtime_failure(Stage::Encode)),
        ..FakeEncoder::new()
    };
    let decoder = FakeDecoder {
        hold_open: true,
        ..FakeDecoder::emitting(synthetic_frames(4))
    };

    let err = tokio::time::timeout(Duration::from_secs(5), pipeline(decoder, &encoder).run())
        .await
        .expect("pipeline hung")
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ProcessRuntime {
            stage: Stage::Encode,
            ..
        }
    ));
}

#[tokio::test]
async fn test_decoder_crash_outranks_truncation() {
    let mut source = synthetic_frames(1);
    source.extend([0u8; 3]);
    let decoder = FakeDecoder {
        delay: Duration::from_millis(50),
        outcome: || Err(runtime_failure(Stage::Decode)),
        ..FakeDecoder::emitting(source)
    };
    let encoder = FakeEncoder::new();

    let err = pipeline(decoder, &encoder).run().await.unwrap_err();

    assert_eq!(err.stage(), Stage::Decode);
    // the whole frame before the crash still reached the encoder
    assert_eq!(encoder.received(), synthetic_frames(1));
}

#[tokio::test]
async fn test_truncated_source_fails_pipeline() {
    let mut source = synthetic_frames(2);
    source.extend([0u8; 4]);
    let encoder = FakeEncoder::new();

    let err = pipeline(FakeDecoder::emitting(source), &encoder)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::FrameTruncation {
            read: 4,
            expected: 8
        }
    ));
    assert_eq!(encoder.frames().len(), 2);
}

#[tokio::test]
async fn test_transform_violation_fails_pipeline() {
    let encoder = FakeEncoder::new();

    let err = pipeline(FakeDecoder::emitting(synthetic_frames(2)), &encoder)
        .with_transform(Box::new(Grow))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::TransformDimension { .. }));
    assert_eq!(err.stage(), Stage::Transform);
    assert!(encoder.received().is_empty());
}

#[tokio::test]
async fn test_cancel_finishes_cleanly() -> anyhow::Result<()> {
    let decoder = FakeDecoder {
        hold_open: true,
        ..FakeDecoder::emitting(synthetic_frames(2))
    };
    let encoder = FakeEncoder::new();
    let cancel = CancellationToken::new();
    let pipe = pipeline(decoder, &encoder).with_cancel(cancel.clone());

    let run = tokio::spawn(pipe.run());
    // both frames are buffered well before this; the decoder then idles
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run).await???;
    assert!(report.stopped_early);
    assert_eq!(report.frames, 2);
    assert_eq!(encoder.received(), synthetic_frames(2));
    Ok(())
}

#[tokio::test]
async fn test_frame_budget_stops_live_source() -> anyhow::Result<()> {
    let decoder = FakeDecoder {
        hold_open: true,
        ..FakeDecoder::emitting(synthetic_frames(10))
    };
    let encoder = FakeEncoder::new();
    let mut config = PipelineConfig::new("live");
    config.pipe_frames = 16;
    config.bridge = BridgeOptions {
        max_frames: Some(3),
        frame_timeout: None,
    };
    let cancel = CancellationToken::new();
    let pipe = Pipeline::new(config, probe(), Box::new(decoder), Box::new(encoder.clone()))
        .with_cancel(cancel.clone());

    let report = tokio::time::timeout(Duration::from_secs(5), pipe.run()).await??;

    assert_eq!(report.frames, 3);
    assert!(report.stopped_early);
    assert_eq!(encoder.received(), synthetic_frames(3));
    // the run's own stop does not leak into the caller's token
    assert!(!cancel.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn test_cancel_with_stalled_encoder() -> anyhow::Result<()> {
    let decoder = FakeDecoder {
        hold_open: true,
        ..FakeDecoder::emitting(synthetic_frames(40))
    };
    let cancel = CancellationToken::new();
    let pipe = Pipeline::new(
        PipelineConfig::new("live"),
        probe(),
        Box::new(decoder),
        Box::new(StalledEncoder),
    )
    .with_cancel(cancel.clone());

    let run = tokio::spawn(pipe.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("pipeline stayed blocked after cancel")??;
    assert!(report.stopped_early);
    Ok(())
}

#[tokio::test]
async fn test_decoder_failure_with_stalled_encoder() {
    let decoder = FakeDecoder {
        delay: Duration::from_millis(100),
        outcome: || Err(runtime_failure(Stage::Decode)),
        // four frames fill the encoder pipe, the rest fit in the decoder pipe
        ..FakeDecoder::emitting(synthetic_frames(6))
    };
    let pipe = Pipeline::new(
        PipelineConfig::new("live"),
        probe(),
        Box::new(decoder),
        Box::new(StalledEncoder),
    );

    let err = tokio::time::timeout(Duration::from_secs(3), pipe.run())
        .await
        .expect("pipeline stayed blocked after decoder failure")
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Decode);
}

// ------------------------------------------------------------------------
// Real subprocesses
// ------------------------------------------------------------------------

struct Cat(String);

impl DecodeStage for Cat {
    fn start(&self, ctx: &StageContext) -> Result<(PipeReader, CompletionSignal), PipelineError> {
        ProcessSupervisor::new(Stage::Decode, CommandSpec::new("cat").arg(self.0.as_str()))
            .spawn_reader(ctx)
    }
}

struct ShellSink(String);

impl EncodeStage for ShellSink {
    fn start(&self, ctx: &StageContext) -> Result<(PipeWriter, CompletionSignal), PipelineError> {
        ProcessSupervisor::new(
            Stage::Encode,
            CommandSpec::new("sh").args(["-c", self.0.as_str()]),
        )
        .spawn_writer(ctx)
    }
}

#[tokio::test]
async fn test_subprocess_pipeline() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("in.raw");
    let output = dir.path().join("out.raw");
    std::fs::write(&input, synthetic_frames(6))?;

    let pipe = Pipeline::new(
        PipelineConfig::new(input.to_string_lossy()),
        probe(),
        Box::new(Cat(input.to_string_lossy().into_owned())),
        Box::new(ShellSink(format!("cat > '{}'", output.display()))),
    )
    .with_transform(Box::new(Invert));

    let report = pipe.run().await?;
    assert_eq!(report.frames, 6);

    let expected: Vec<u8> = synthetic_frames(6).iter().map(|b| !b).collect();
    assert_eq!(std::fs::read(&output)?, expected);
    Ok(())
}

#[tokio::test]
async fn test_subprocess_encoder_exit_code() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("in.raw");
    std::fs::write(&input, synthetic_frames(2))?;

    let pipe = Pipeline::new(
        PipelineConfig::new("in.raw"),
        probe(),
        Box::new(Cat(input.to_string_lossy().into_owned())),
        Box::new(ShellSink("cat > /dev/null; exit 7".to_string())),
    );

    match pipe.run().await {
        Err(PipelineError::ProcessRuntime { stage, code, .. }) => {
            assert_eq!(stage, Stage::Encode);
            assert_eq!(code, Some(7));
        }
        other => panic!("expected encoder failure, got {:?}", other),
    }
    Ok(())
}

fn ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Requires ffmpeg on PATH; decodes a generated test pattern and re-encodes it.
#[tokio::test]
async fn test_ffmpeg_round_trip() -> anyhow::Result<()> {
    if !ffmpeg_available() {
        eprintln!("skip: ffmpeg not found");
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("out.mkv");
    let geometry = StreamGeometry::new(64, 48, PixelFormat::Bgr24)?;

    let decoder = FfmpegDecoder::new(DecodeSettings {
        input_format: Some("lavfi".to_string()),
        ..DecodeSettings::new("testsrc=size=64x48:rate=10:duration=1")
    });
    let encoder = FfmpegEncoder::new(EncodeSettings {
        format: "matroska".to_string(),
        codec: "ffv1".to_string(),
        preset: None,
        pixel_format: "bgr0".to_string(),
        frame_rate: 10,
        ..EncodeSettings::new(output.to_string_lossy())
    });
    let pipe = Pipeline::new(
        PipelineConfig::new("testsrc"),
        Arc::new(FixedGeometry(geometry)),
        Box::new(decoder),
        Box::new(encoder),
    );

    let report = pipe.run().await?;
    assert_eq!(report.frames, 10);
    assert_eq!(report.bytes, 10 * 64 * 48 * 3);
    assert!(std::fs::metadata(&output)?.len() > 0);
    Ok(())
}
