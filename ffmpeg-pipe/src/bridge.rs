//! Frame-accurate forwarding between two byte streams.
//!
//! ```text
//! source ──► FrameReader ──► transform ──► length check ──► FrameWriter ──► destination
//! ```
//!
//! Frames leave in the order they arrive. The destination is shut down exactly
//! once whichever way the loop ends, so the consumer always sees end of stream.

use std::{future::Future, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{PipelineError, Stage},
    frame::{Frame, FrameReader, FrameWriter},
    geometry::StreamGeometry,
    transform::FrameTransform,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// Fail when reading or writing a single frame takes longer than this.
    pub frame_timeout: Option<Duration>,
}

/// Why the forwarding loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    EndOfStream,
    Cancelled,
    FrameBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSummary {
    pub frames: u64,
    pub bytes: u64,
    pub exit: BridgeExit,
}

pub struct PipeBridge {
    geometry: StreamGeometry,
    transform: Option<Box<dyn FrameTransform>>,
    options: BridgeOptions,
    cancel: CancellationToken,
}

impl PipeBridge {
    pub fn new(geometry: StreamGeometry) -> Self {
        Self {
            geometry,
            transform: None,
            options: BridgeOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_transform(mut self, transform: Box<dyn FrameTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Token observed between frames; the bridge also cancels it when the
    /// frame budget runs out so upstream stages stop producing.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spawn<R, W>(
        self,
        source: R,
        destination: W,
    ) -> JoinHandle<Result<BridgeSummary, PipelineError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(source, destination))
    }

    pub async fn run<R, W>(
        mut self,
        source: R,
        destination: W,
    ) -> Result<BridgeSummary, PipelineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let name = self
            .transform
            .as_ref()
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| "identity".to_string());
        log::info!("bridge: forwarding {} frames via {}", self.geometry, name);

        let mut reader = FrameReader::new(source, &self.geometry);
        let mut writer = FrameWriter::new(destination, &self.geometry);
        let result = self.forward(&mut reader, &mut writer).await;

        let closed = writer.shutdown().await;
        drop(writer);

        match (result, closed) {
            (Ok(summary), Ok(())) => {
                log::info!(
                    "bridge: finished ({:?}) after {} frames, {} bytes",
                    summary.exit,
                    summary.frames,
                    summary.bytes
                );
                Ok(summary)
            }
            (Ok(summary), Err(e)) if summary.exit != BridgeExit::EndOfStream => {
                // The consumer may already be gone when we stop early.
                log::debug!("bridge: close after early stop failed: {}", e);
                Ok(summary)
            }
            (Ok(_), Err(source)) => Err(PipelineError::Io {
                stage: Stage::Bridge,
                source,
            }),
            (Err(e), _) => {
                log::error!("bridge: failed: {}", e);
                Err(e)
            }
        }
    }

    async fn forward<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<BridgeSummary, PipelineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let expected = self.geometry.frame_len();
        let timeout = self.options.frame_timeout;
        let mut summary = BridgeSummary {
            frames: 0,
            bytes: 0,
            exit: BridgeExit::EndOfStream,
        };

        loop {
            if self.options.max_frames.is_some_and(|max| summary.frames >= max) {
                log::info!("bridge: frame budget of {} reached", summary.frames);
                self.cancel.cancel();
                summary.exit = BridgeExit::FrameBudget;
                return Ok(summary);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.exit = BridgeExit::Cancelled;
                    return Ok(summary);
                }
                next = with_timeout(timeout, reader.read_frame()) => next?,
            };
            let Some(frame) = next else {
                return Ok(summary);
            };

            let frame = self.apply_transform(frame).await?;
            if frame.len() != expected {
                return Err(PipelineError::TransformDimension {
                    expected,
                    actual: frame.len(),
                });
            }

            // A consumer that stops reading must not keep the bridge from stopping.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.exit = BridgeExit::Cancelled;
                    return Ok(summary);
                }
                written = with_timeout(timeout, writer.write_frame(&frame)) => written?,
            }
            summary.frames += 1;
            summary.bytes += frame.len() as u64;
            log::trace!("bridge: forwarded {}", frame);
        }
    }

    async fn apply_transform(&mut self, frame: Frame) -> Result<Frame, PipelineError> {
        let Some(mut transform) = self.transform.take() else {
            return Ok(frame);
        };
        let seq = frame.seq();
        let (transform, result) = tokio::task::spawn_blocking(move || {
            let result = transform.apply(frame);
            (transform, result)
        })
        .await
        .map_err(|e| PipelineError::Transform {
            seq,
            reason: e.to_string(),
        })?;
        self.transform = Some(transform);
        result
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PipelineError::FrameTimeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;
