//! Decode ─► bridge ─► encode orchestration.
//!
//! ```text
//!  probe ──► StreamGeometry
//!                │
//!  source ──► [decoder] ══pipe══► [bridge + transform] ══pipe══► [encoder] ──► sink
//!                 │                        │                         │
//!                 └──── CompletionSignal ──┴──── JoinHandle ─────────┴──► aggregate
//! ```
//!
//! Every stage runs as its own task. The orchestrator waits on all three
//! outcomes in whatever order they arrive and reports a single result.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::{BridgeExit, BridgeOptions, BridgeSummary, PipeBridge},
    decoder::DecodeStage,
    encoder::EncodeStage,
    error::{PipelineError, Stage},
    geometry::StreamGeometry,
    metadata::SourceProbe,
    process::{CompletionSignal, StageContext},
    transform::FrameTransform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ProbingGeometry,
    Running,
    Draining,
    Completed { success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Handed to the probe; the decoder carries its own copy.
    pub source: String,
    /// Capacity of each in-memory pipe, in frames.
    pub pipe_frames: usize,
    pub bridge: BridgeOptions,
}

impl PipelineConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pipe_frames: 4,
            bridge: BridgeOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub geometry: StreamGeometry,
    pub frames: u64,
    pub bytes: u64,
    /// Stopped by cancellation or frame budget rather than end of source.
    pub stopped_early: bool,
}

/// Builds the transform once the geometry is known.
pub type TransformFactory =
    Box<dyn FnOnce(&StreamGeometry) -> Result<Box<dyn FrameTransform>, PipelineError> + Send>;

pub struct Pipeline {
    config: PipelineConfig,
    probe: Arc<dyn SourceProbe>,
    decoder: Box<dyn DecodeStage>,
    encoder: Box<dyn EncodeStage>,
    transform: Option<TransformFactory>,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        probe: Arc<dyn SourceProbe>,
        decoder: Box<dyn DecodeStage>,
        encoder: Box<dyn EncodeStage>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            probe,
            decoder,
            encoder,
            transform: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_transform(self, transform: Box<dyn FrameTransform>) -> Self {
        self.with_transform_factory(move |_| Ok(transform))
    }

    /// For transforms that depend on the probed geometry. Runs before any
    /// process is started, so a failure here launches nothing.
    pub fn with_transform_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&StreamGeometry) -> Result<Box<dyn FrameTransform>, PipelineError>
            + Send
            + 'static,
    {
        self.transform = Some(Box::new(factory));
        self
    }

    /// Cancelling the token stops the run early; the sink is still finalised.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        let result = self.run_inner().await;
        self.set_state(PipelineState::Completed {
            success: result.is_ok(),
        });
        match &result {
            Ok(report) => log::info!(
                "pipeline {}: done, {} frames ({} bytes){}",
                self.config.source,
                report.frames,
                report.bytes,
                if report.stopped_early { ", stopped early" } else { "" }
            ),
            Err(e) => log::error!(
                "pipeline {}: failed in {} stage: {}",
                self.config.source,
                e.stage(),
                e
            ),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<PipelineReport, PipelineError> {
        self.set_state(PipelineState::ProbingGeometry);
        let geometry = probe_geometry(Arc::clone(&self.probe), self.config.source.clone()).await?;
        log::info!("pipeline {}: geometry {}", self.config.source, geometry);

        let transform = match self.transform.take() {
            Some(factory) => {
                let transform = factory(&geometry)?;
                log::info!("pipeline {}: transform {}", self.config.source, transform.name());
                Some(transform)
            }
            None => None,
        };

        self.set_state(PipelineState::Running);
        // Stopping this run (frame budget, failure) must not cancel the caller's token.
        let run_cancel = self.cancel.child_token();
        let ctx = StageContext::new(geometry, self.config.pipe_frames, run_cancel.clone());

        let (decoded, decode_done) = self.decoder.start(&ctx)?;
        let (encoded, encode_done) = match self.encoder.start(&ctx) {
            Ok(started) => started,
            Err(e) => {
                run_cancel.cancel();
                drop(decoded);
                if let Err(decode_err) = decode_done.await {
                    log::debug!("decoder after encoder launch failure: {}", decode_err);
                }
                return Err(e);
            }
        };

        let mut bridge = PipeBridge::new(geometry)
            .with_options(self.config.bridge)
            .with_cancel(run_cancel.clone());
        if let Some(transform) = transform {
            bridge = bridge.with_transform(transform);
        }
        let bridge_done = bridge.spawn(decoded, encoded);

        self.set_state(PipelineState::Draining);
        let summary = drain(decode_done, bridge_done, encode_done, &run_cancel).await?;

        Ok(PipelineReport {
            geometry,
            frames: summary.frames,
            bytes: summary.bytes,
            stopped_early: summary.exit != BridgeExit::EndOfStream,
        })
    }

    fn set_state(&self, next: PipelineState) {
        let prev = self.state.send_replace(next);
        log::info!("pipeline {}: {:?} -> {:?}", self.config.source, prev, next);
    }
}

async fn probe_geometry(
    probe: Arc<dyn SourceProbe>,
    source: String,
) -> Result<StreamGeometry, PipelineError> {
    tokio::task::spawn_blocking(move || probe.probe(&source))
        .await
        .map_err(|_| PipelineError::StageAborted {
            stage: Stage::Probe,
        })?
}

/// A failure caused by another stage stopping: the peer closed its pipe end,
/// or upstream ended part way through a frame.
fn is_symptom(error: &PipelineError) -> bool {
    error.is_peer_closed() || matches!(error, PipelineError::FrameTruncation { .. })
}

/// Failures in the order they were observed.
///
/// Symptoms are reported only when no stage failed on its own account.
#[derive(Default)]
struct FailureLog {
    cause: Option<PipelineError>,
    symptom: Option<PipelineError>,
}

impl FailureLog {
    fn record(&mut self, error: PipelineError) {
        let slot = if is_symptom(&error) {
            &mut self.symptom
        } else {
            &mut self.cause
        };
        if slot.is_none() {
            *slot = Some(error);
        } else {
            log::debug!("later failure in {} stage: {}", error.stage(), error);
        }
    }

    fn is_empty(&self) -> bool {
        self.cause.is_none() && self.symptom.is_none()
    }

    fn into_error(self) -> Option<PipelineError> {
        self.cause.or(self.symptom)
    }
}

/// Waits for decoder, bridge and encoder in arrival order.
///
/// On simultaneous readiness the decoder is looked at first, then the bridge,
/// then the encoder. The first failure stops the remaining stages.
async fn drain(
    mut decode: CompletionSignal,
    mut bridge: JoinHandle<Result<BridgeSummary, PipelineError>>,
    mut encode: CompletionSignal,
    cancel: &CancellationToken,
) -> Result<BridgeSummary, PipelineError> {
    let (mut decode_done, mut bridge_done, mut encode_done) = (false, false, false);
    let mut failures = FailureLog::default();
    let mut summary = None;

    while !(decode_done && bridge_done && encode_done) {
        let observed = tokio::select! {
            biased;
            result = &mut decode, if !decode_done => {
                decode_done = true;
                result.err()
            }
            result = &mut bridge, if !bridge_done => {
                bridge_done = true;
                match result {
                    Ok(Ok(s)) => {
                        summary = Some(s);
                        None
                    }
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(PipelineError::StageAborted { stage: Stage::Bridge }),
                }
            }
            result = &mut encode, if !encode_done => {
                encode_done = true;
                result.err()
            }
        };

        if let Some(error) = observed {
            if failures.is_empty() {
                cancel.cancel();
            }
            failures.record(error);
        }
    }

    match failures.into_error() {
        Some(error) => Err(error),
        None => summary.ok_or(PipelineError::StageAborted {
            stage: Stage::Bridge,
        }),
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
