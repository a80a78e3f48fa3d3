//! Source geometry probing (similar to ffprobe).

use std::process::Command;

use serde::Deserialize;

use crate::{
    error::PipelineError,
    geometry::{PixelFormat, StreamGeometry},
};

/// Determines the geometry of a source before any process is started.
///
/// Implementations may block; the pipeline calls them off the async workers.
pub trait SourceProbe: Send + Sync {
    fn probe(&self, source: &str) -> Result<StreamGeometry, PipelineError>;
}

/// Per-stream info as printed by `ffprobe -show_streams -print_format json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub index: usize,
    /// "video" | "audio" | "subtitle" etc.
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    /// Video only.
    #[serde(default)]
    pub width: Option<u32>,
    /// Video only.
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// First video stream with known, non-zero dimensions.
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| {
            s.codec_type.as_deref() == Some("video")
                && s.width.is_some_and(|w| w > 0)
                && s.height.is_some_and(|h| h > 0)
        })
    }

    pub fn geometry(
        &self,
        source: &str,
        pixel_format: PixelFormat,
    ) -> Result<StreamGeometry, PipelineError> {
        let stream = self.video_stream().ok_or_else(|| PipelineError::Probe {
            source_id: source.to_string(),
            reason: "no video stream".to_string(),
        })?;
        log::info!(
            "probe {}: video stream #{} {} {}x{}",
            source,
            stream.index,
            stream.codec_name.as_deref().unwrap_or("?"),
            stream.width.unwrap_or_default(),
            stream.height.unwrap_or_default()
        );
        StreamGeometry::new(
            stream.width.unwrap_or_default(),
            stream.height.unwrap_or_default(),
            pixel_format,
        )
    }
}

/// Runs `ffprobe` and reads the first video stream's dimensions.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: String,
    pixel_format: PixelFormat,
}

impl FfprobeProbe {
    pub fn new(pixel_format: PixelFormat) -> Self {
        Self {
            program: "ffprobe".to_string(),
            pixel_format,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl SourceProbe for FfprobeProbe {
    fn probe(&self, source: &str) -> Result<StreamGeometry, PipelineError> {
        let probe_error = |reason: String| PipelineError::Probe {
            source_id: source.to_string(),
            reason,
        };

        let output = Command::new(&self.program)
            .args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(source)
            .output()
            .map_err(|e| probe_error(format!("cannot run {}: {}", self.program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(probe_error(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        let info = MediaInfo::parse(&json).map_err(|e| probe_error(e.to_string()))?;
        info.geometry(source, self.pixel_format)
    }
}

/// Geometry known up front, e.g. for raw sources that carry no header.
#[derive(Debug, Clone, Copy)]
pub struct FixedGeometry(pub StreamGeometry);

impl SourceProbe for FixedGeometry {
    fn probe(&self, _source: &str) -> Result<StreamGeometry, PipelineError> {
        Ok(self.0)
    }
}

/// Opens the source through libav and reads the best video stream.
#[cfg(feature = "libav")]
#[derive(Debug, Clone)]
pub struct LibavProbe {
    pixel_format: PixelFormat,
}

#[cfg(feature = "libav")]
impl LibavProbe {
    pub fn new(pixel_format: PixelFormat) -> Result<Self, PipelineError> {
        crate::init()?;
        Ok(Self { pixel_format })
    }
}

#[cfg(feature = "libav")]
impl SourceProbe for LibavProbe {
    fn probe(&self, source: &str) -> Result<StreamGeometry, PipelineError> {
        let probe_error = |reason: String| PipelineError::Probe {
            source_id: source.to_string(),
            reason,
        };
        let input = ffmpeg_next::format::input(source).map_err(|e| probe_error(e.to_string()))?;
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| probe_error("no video stream".to_string()))?;
        let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| probe_error(e.to_string()))?;
        StreamGeometry::new(decoder.width(), decoder.height(), self.pixel_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFPROBE_OUTPUT: &str = r#"{
        "streams": [
            { "index": 0, "codec_name": "aac", "codec_type": "audio", "sample_rate": "48000" },
            { "index": 1, "codec_name": "h264", "codec_type": "video", "width": 1280, "height": 720 }
        ]
    }"#;

    #[test]
    fn test_parse_ffprobe_output() -> anyhow::Result<()> {
        let info = MediaInfo::parse(FFPROBE_OUTPUT)?;
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.video_stream().map(|s| s.index), Some(1));

        let geometry = info.geometry("in.mp4", PixelFormat::Bgr24)?;
        assert_eq!((geometry.width(), geometry.height()), (1280, 720));
        assert_eq!(geometry.frame_len(), 1280 * 720 * 3);
        Ok(())
    }

    #[test]
    fn test_no_video_stream() -> anyhow::Result<()> {
        let info = MediaInfo::parse(r#"{ "streams": [ { "index": 0, "codec_type": "audio" } ] }"#)?;
        match info.geometry("song.mp3", PixelFormat::Bgr24) {
            Err(PipelineError::Probe { source_id, reason }) => {
                assert_eq!(source_id, "song.mp3");
                assert_eq!(reason, "no video stream");
            }
            other => panic!("expected probe error, got {:?}", other),
        }

        let info = MediaInfo::parse("{}")?;
        assert!(info.video_stream().is_none());
        Ok(())
    }

    #[test]
    fn test_zero_sized_video_skipped() -> anyhow::Result<()> {
        let info = MediaInfo::parse(
            r#"{ "streams": [ { "index": 0, "codec_type": "video", "width": 0, "height": 0 } ] }"#,
        )?;
        assert!(info.geometry("broken.mp4", PixelFormat::Bgr24).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_ffprobe_is_probe_error() {
        let probe = FfprobeProbe::new(PixelFormat::Bgr24).with_program("/nonexistent/ffprobe");
        assert!(matches!(
            probe.probe("in.mp4"),
            Err(PipelineError::Probe { .. })
        ));
    }

    #[test]
    fn test_fixed_geometry() -> anyhow::Result<()> {
        let geometry = StreamGeometry::new(2, 2, PixelFormat::Rgb565le)?;
        assert_eq!(FixedGeometry(geometry).probe("anything")?, geometry);
        Ok(())
    }
}
