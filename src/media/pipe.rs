use std::sync::Arc;

use ffmpeg_pipe::{
    decoder::FfmpegDecoder,
    encoder::FfmpegEncoder,
    error::PipelineError,
    geometry::StreamGeometry,
    metadata::{FixedGeometry, SourceProbe},
    pipeline::{Pipeline, PipelineConfig},
    transform::{Annotate, AnnotationStyle, Dim, FixedRegions, FrameTransform, Identity},
};
use tokio_util::sync::CancellationToken;

use crate::config::{RelayConfig, TransformConfig};

/// Builds the relay pipeline for `config`. The config must already be validated.
pub fn build(config: &RelayConfig, cancel: CancellationToken) -> anyhow::Result<Pipeline> {
    let probe = probe_for(config)?;

    let mut pipe_config = PipelineConfig::new(&config.source);
    pipe_config.pipe_frames = config.pipe_frames;
    pipe_config.bridge = config.bridge_options();

    let decoder = FfmpegDecoder::new(config.decode_settings());
    let encoder = FfmpegEncoder::new(config.encode_settings());
    log::info!(
        "relay: {} -> {} ({} {})",
        config.source,
        config.sink,
        config.output.format,
        config.output.codec
    );

    let pipeline = Pipeline::new(pipe_config, probe, Box::new(decoder), Box::new(encoder))
        .with_cancel(cancel);
    Ok(match transform_kind(&config.transform) {
        TransformKind::None => pipeline,
        kind => {
            let transform = config.transform.clone();
            let style = config.annotation_style();
            pipeline.with_transform_factory(move |geometry| {
                build_transform(kind, &transform, *geometry, style)
            })
        }
    })
}

fn probe_for(config: &RelayConfig) -> anyhow::Result<Arc<dyn SourceProbe>> {
    if let Some(geometry) = config.fixed_geometry()? {
        log::info!("relay: using fixed geometry {}", geometry);
        return Ok(Arc::new(FixedGeometry(geometry)));
    }
    #[cfg(feature = "libav")]
    {
        Ok(Arc::new(ffmpeg_pipe::metadata::LibavProbe::new(
            config.pixel_format,
        )?))
    }
    #[cfg(not(feature = "libav"))]
    {
        Ok(Arc::new(ffmpeg_pipe::metadata::FfprobeProbe::new(
            config.pixel_format,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    None,
    Annotate,
    Dim(u8),
}

pub fn transform_kind(config: &TransformConfig) -> TransformKind {
    if config.annotate {
        TransformKind::Annotate
    } else if let Some(divisor) = config.dim {
        TransformKind::Dim(divisor)
    } else {
        TransformKind::None
    }
}

fn build_transform(
    kind: TransformKind,
    config: &TransformConfig,
    geometry: StreamGeometry,
    style: AnnotationStyle,
) -> Result<Box<dyn FrameTransform>, PipelineError> {
    match kind {
        TransformKind::Annotate => {
            let path = config.regions.as_deref().ok_or_else(|| PipelineError::TransformInit {
                reason: "no region model given".to_string(),
            })?;
            let detector = FixedRegions::load(path)?;
            Ok(Box::new(Annotate::new(geometry, detector).with_style(style)))
        }
        TransformKind::Dim(divisor) => Ok(Box::new(Dim::new(divisor)?)),
        TransformKind::None => Ok(Box::new(Identity)),
    }
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;
