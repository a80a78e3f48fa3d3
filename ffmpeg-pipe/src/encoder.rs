use crate::{
    error::{PipelineError, Stage},
    process::{CommandSpec, CompletionSignal, PipeWriter, ProcessSupervisor, StageContext},
};

/// Consumes raw frames at the negotiated geometry and delivers them to a sink.
pub trait EncodeStage: Send + Sync {
    /// Launch failures are returned here, never through the signal.
    fn start(&self, ctx: &StageContext) -> Result<(PipeWriter, CompletionSignal), PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    /// File path or streaming URL; created or overwritten.
    pub sink: String,
    // "flv", "mp4", "rtsp", "mpegts"
    pub format: String,
    // "libx264", "libx265", "mpeg4"
    pub codec: String,
    // "ultrafast", "medium", etc.; None = encoder default
    pub preset: Option<String>,
    // "yuv420p", etc.
    pub pixel_format: String,
    pub frame_rate: u32,
    pub program: String,
}

impl EncodeSettings {
    pub fn new(sink: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            ..Default::default()
        }
    }
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            sink: String::new(),
            format: "flv".to_string(),
            codec: "libx264".to_string(),
            preset: Some("ultrafast".to_string()),
            pixel_format: "yuv420p".to_string(),
            frame_rate: 25,
            program: "ffmpeg".to_string(),
        }
    }
}

/// `ffmpeg -f rawvideo -pix_fmt <fmt> -s WxH -r <rate> -i pipe:0 ... <sink>`
pub struct FfmpegEncoder {
    settings: EncodeSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: EncodeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    pub fn command(&self, ctx: &StageContext) -> CommandSpec {
        let settings = &self.settings;
        let rate = settings.frame_rate.to_string();
        let mut spec = CommandSpec::new(&settings.program)
            .args(["-hide_banner", "-loglevel", "warning", "-y"])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", ctx.geometry.pixel_format().name()])
            .args(["-s", ctx.geometry.size_arg().as_str()])
            .args(["-r", rate.as_str()])
            .args(["-i", "pipe:0"])
            .args(["-pix_fmt", settings.pixel_format.as_str()])
            .args(["-c:v", settings.codec.as_str()]);
        if let Some(preset) = &settings.preset {
            spec = spec.args(["-preset", preset.as_str()]);
        }
        spec.args(["-r", rate.as_str()])
            .args(["-f", settings.format.as_str()])
            .arg(settings.sink.as_str())
    }
}

impl EncodeStage for FfmpegEncoder {
    fn start(&self, ctx: &StageContext) -> Result<(PipeWriter, CompletionSignal), PipelineError> {
        if self.settings.sink.trim().is_empty() || self.settings.frame_rate == 0 {
            return Err(PipelineError::ProcessLaunch {
                stage: Stage::Encode,
                program: self.settings.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "encoder needs a sink and a non-zero frame rate",
                ),
            });
        }
        ProcessSupervisor::new(Stage::Encode, self.command(ctx)).spawn_writer(ctx)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::geometry::{PixelFormat, StreamGeometry};

    fn context() -> StageContext {
        let geometry = StreamGeometry::new(1280, 720, PixelFormat::Bgr24).unwrap();
        StageContext::new(geometry, 2, CancellationToken::new())
    }

    #[test]
    fn test_encode_settings_default() {
        let settings = EncodeSettings::default();
        assert_eq!(settings.format, "flv");
        assert_eq!(settings.codec, "libx264");
        assert_eq!(settings.preset.as_deref(), Some("ultrafast"));
        assert_eq!(settings.pixel_format, "yuv420p");
        assert_eq!(settings.frame_rate, 25);
    }

    #[test]
    fn test_encoder_command() {
        let encoder = FfmpegEncoder::new(EncodeSettings::new("rtmp://127.0.0.1:1935/live/stream"));
        assert_eq!(
            encoder.command(&context()).to_string(),
            "ffmpeg -hide_banner -loglevel warning -y -f rawvideo -pix_fmt bgr24 -s 1280x720 \
             -r 25 -i pipe:0 -pix_fmt yuv420p -c:v libx264 -preset ultrafast -r 25 -f flv \
             rtmp://127.0.0.1:1935/live/stream"
        );
    }

    #[test]
    fn test_encoder_command_without_preset() {
        let settings = EncodeSettings {
            preset: None,
            format: "mp4".to_string(),
            codec: "mpeg4".to_string(),
            ..EncodeSettings::new("out.mp4")
        };
        let args = FfmpegEncoder::new(settings).command(&context()).get_args().join(" ");
        assert!(!args.contains("-preset"));
        assert!(args.ends_with("-c:v mpeg4 -r 25 -f mp4 out.mp4"));
    }

    #[tokio::test]
    async fn test_zero_rate_fails_launch() {
        let settings = EncodeSettings {
            frame_rate: 0,
            ..EncodeSettings::new("out.flv")
        };
        assert!(matches!(
            FfmpegEncoder::new(settings).start(&context()),
            Err(PipelineError::ProcessLaunch {
                stage: Stage::Encode,
                ..
            })
        ));
    }
}
