use crate::{
    error::{PipelineError, Stage},
    process::{CommandSpec, CompletionSignal, PipeReader, ProcessSupervisor, StageContext},
};

/// Produces raw frames at the negotiated geometry.
pub trait DecodeStage: Send + Sync {
    /// Launch failures are returned here, never through the signal.
    fn start(&self, ctx: &StageContext) -> Result<(PipeReader, CompletionSignal), PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSettings {
    /// File path, device path or network URI.
    pub source: String,
    /// Forced demuxer, e.g. "v4l2"; None = let ffmpeg probe.
    pub input_format: Option<String>,
    /// Read the input at its native frame rate (`-re`), for replaying files live.
    pub realtime: bool,
    pub program: String,
}

impl DecodeSettings {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            input_format: None,
            realtime: false,
            program: "ffmpeg".to_string(),
        }
    }
}

/// `ffmpeg -i <source> -f rawvideo -pix_fmt <fmt> -s WxH pipe:1`
///
/// Output is pinned to the negotiated size; a declared size that differs from
/// the source's scales it.
pub struct FfmpegDecoder {
    settings: DecodeSettings,
}

impl FfmpegDecoder {
    pub fn new(settings: DecodeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DecodeSettings {
        &self.settings
    }

    pub fn command(&self, ctx: &StageContext) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.settings.program)
            .args(["-hide_banner", "-loglevel", "warning", "-nostdin"]);
        if self.settings.realtime {
            spec = spec.arg("-re");
        }
        if let Some(format) = &self.settings.input_format {
            spec = spec.args(["-f", format.as_str()]);
        }
        spec.args(["-i", self.settings.source.as_str()])
            .args(["-an", "-sn", "-f", "rawvideo"])
            .args(["-pix_fmt", ctx.geometry.pixel_format().name()])
            .args(["-s", ctx.geometry.size_arg().as_str()])
            .arg("pipe:1")
    }
}

impl DecodeStage for FfmpegDecoder {
    fn start(&self, ctx: &StageContext) -> Result<(PipeReader, CompletionSignal), PipelineError> {
        if self.settings.source.trim().is_empty() {
            return Err(PipelineError::ProcessLaunch {
                stage: Stage::Decode,
                program: self.settings.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty source identifier",
                ),
            });
        }
        ProcessSupervisor::new(Stage::Decode, self.command(ctx)).spawn_reader(ctx)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::geometry::{PixelFormat, StreamGeometry};

    fn context() -> StageContext {
        let geometry = StreamGeometry::new(640, 480, PixelFormat::Bgr24).unwrap();
        StageContext::new(geometry, 2, CancellationToken::new())
    }

    #[test]
    fn test_decoder_command() {
        let decoder = FfmpegDecoder::new(DecodeSettings::new("rtsp://127.0.0.1/cam"));
        let spec = decoder.command(&context());
        assert_eq!(
            spec.to_string(),
            "ffmpeg -hide_banner -loglevel warning -nostdin -i rtsp://127.0.0.1/cam \
             -an -sn -f rawvideo -pix_fmt bgr24 -s 640x480 pipe:1"
        );
    }

    #[test]
    fn test_decoder_command_with_device_format() {
        let settings = DecodeSettings {
            input_format: Some("v4l2".to_string()),
            realtime: true,
            ..DecodeSettings::new("/dev/video0")
        };
        let spec = FfmpegDecoder::new(settings).command(&context());
        let args = spec.get_args().join(" ");
        assert!(args.contains("-re -f v4l2 -i /dev/video0"));
    }

    #[test]
    fn test_decoder_output_pinned_to_geometry() {
        let geometry = StreamGeometry::new(320, 240, PixelFormat::Gray).unwrap();
        let ctx = StageContext::new(geometry, 2, CancellationToken::new());
        let args = FfmpegDecoder::new(DecodeSettings::new("in.mp4"))
            .command(&ctx)
            .get_args()
            .join(" ");
        assert!(args.ends_with("-pix_fmt gray -s 320x240 pipe:1"));
    }

    #[tokio::test]
    async fn test_empty_source_fails_launch() {
        let decoder = FfmpegDecoder::new(DecodeSettings::new("  "));
        assert!(matches!(
            decoder.start(&context()),
            Err(PipelineError::ProcessLaunch {
                stage: Stage::Decode,
                ..
            })
        ));
    }
}
