use std::{path::Path, time::Duration};

use anyhow::{bail, Context};
use ffmpeg_pipe::{
    bridge::BridgeOptions,
    decoder::DecodeSettings,
    encoder::EncodeSettings,
    geometry::{PixelFormat, StreamGeometry},
    transform::AnnotationStyle,
};
use serde::{Deserialize, Serialize};

/// Everything a relay run needs; loaded from JSON, then overridden by flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub source: String,
    pub sink: String,
    /// Forced demuxer for the source, e.g. "v4l2".
    pub input_format: Option<String>,
    pub realtime: bool,
    /// "WxH"; skips probing when set.
    pub size: Option<String>,
    // raw pipe format
    pub pixel_format: PixelFormat,
    pub output: OutputConfig,
    pub transform: TransformConfig,
    pub pipe_frames: usize,
    pub max_frames: Option<u64>,
    pub frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    // "flv", "mp4", "mpegts"
    pub format: String,
    pub codec: String,
    pub preset: Option<String>,
    pub pixel_format: String,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub annotate: bool,
    /// JSON region model for the annotate transform.
    pub regions: Option<String>,
    pub color: [u8; 3],
    pub thickness: u32,
    /// Divide every sample by this value; ignored when annotating.
    pub dim: Option<u8>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            sink: String::new(),
            input_format: None,
            realtime: false,
            size: None,
            pixel_format: PixelFormat::default(),
            output: OutputConfig::default(),
            transform: TransformConfig::default(),
            pipe_frames: 4,
            max_frames: None,
            frame_timeout_ms: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        let encode = EncodeSettings::default();
        Self {
            format: encode.format,
            codec: encode.codec,
            preset: encode.preset,
            pixel_format: encode.pixel_format,
            frame_rate: encode.frame_rate,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        let style = AnnotationStyle::default();
        Self {
            annotate: false,
            regions: None,
            color: style.color,
            thickness: style.thickness,
            dim: None,
        }
    }
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.trim().is_empty() {
            bail!("source is required");
        }
        if self.sink.trim().is_empty() {
            bail!("sink is required");
        }
        if self.output.frame_rate == 0 {
            bail!("frame rate must be positive");
        }
        if self.pipe_frames == 0 {
            bail!("pipe capacity must be at least one frame");
        }
        if self.transform.annotate && self.transform.regions.is_none() {
            bail!("annotate needs a region model (--regions)");
        }
        if self.transform.dim == Some(0) {
            bail!("dim divisor must be positive");
        }
        self.fixed_geometry()?;
        Ok(())
    }

    /// Geometry from `size`, if the source dimensions are known up front.
    pub fn fixed_geometry(&self) -> anyhow::Result<Option<StreamGeometry>> {
        let Some(size) = &self.size else {
            return Ok(None);
        };
        let (w, h) = size
            .split_once(['x', 'X'])
            .with_context(|| format!("size `{}` is not WxH", size))?;
        let width = w.trim().parse().with_context(|| format!("bad width in `{}`", size))?;
        let height = h.trim().parse().with_context(|| format!("bad height in `{}`", size))?;
        Ok(Some(StreamGeometry::new(width, height, self.pixel_format)?))
    }

    pub fn decode_settings(&self) -> DecodeSettings {
        DecodeSettings {
            input_format: self.input_format.clone(),
            realtime: self.realtime,
            ..DecodeSettings::new(&self.source)
        }
    }

    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            format: self.output.format.clone(),
            codec: self.output.codec.clone(),
            preset: self.output.preset.clone(),
            pixel_format: self.output.pixel_format.clone(),
            frame_rate: self.output.frame_rate,
            ..EncodeSettings::new(&self.sink)
        }
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            max_frames: self.max_frames,
            frame_timeout: self.frame_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn annotation_style(&self) -> AnnotationStyle {
        AnnotationStyle {
            color: self.transform.color,
            thickness: self.transform.thickness,
            ..AnnotationStyle::default()
        }
    }
}
