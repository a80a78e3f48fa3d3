use std::{future::Future, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use ffmpeg_pipe::geometry::PixelFormat;
use tokio_util::sync::CancellationToken;

mod config;
mod media;

use config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "lite-relay")]
#[command(about = "Relay a video source through a raw-frame pipeline into an ffmpeg sink")]
#[command(version)]
struct Cli {
    /// File path, device path or network URI
    source: Option<String>,

    /// Output file or streaming URL
    sink: Option<String>,

    /// JSON config file; flags override its fields
    #[arg(short, long, env = "LITE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Draw region annotations on every frame
    #[arg(long)]
    annotate: bool,

    /// Region model for --annotate
    #[arg(long)]
    regions: Option<String>,

    /// Divide every sample by this value
    #[arg(long)]
    dim: Option<u8>,

    /// Output container, e.g. flv, mp4, mpegts
    #[arg(long)]
    format: Option<String>,

    #[arg(long)]
    codec: Option<String>,

    #[arg(long)]
    preset: Option<String>,

    #[arg(long)]
    rate: Option<u32>,

    /// Raw pipe pixel format
    #[arg(long)]
    pix_fmt: Option<PixelFormat>,

    #[arg(long)]
    out_pix_fmt: Option<String>,

    /// Forced source demuxer, e.g. v4l2
    #[arg(long)]
    input_format: Option<String>,

    /// Read the source at its native frame rate
    #[arg(long)]
    realtime: bool,

    /// Source size as WxH; skips probing and scales the source to it
    #[arg(long)]
    size: Option<String>,

    #[arg(long)]
    max_frames: Option<u64>,

    #[arg(long)]
    frame_timeout_ms: Option<u64>,

    /// Capacity of each in-memory pipe, in frames
    #[arg(long)]
    pipe_frames: Option<usize>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        config.transform.annotate |= self.annotate;
        config.realtime |= self.realtime;
        if self.regions.is_some() {
            config.transform.regions = self.regions;
        }
        if self.dim.is_some() {
            config.transform.dim = self.dim;
        }
        if let Some(format) = self.format {
            config.output.format = format;
        }
        if let Some(codec) = self.codec {
            config.output.codec = codec;
        }
        if self.preset.is_some() {
            config.output.preset = self.preset;
        }
        if let Some(rate) = self.rate {
            config.output.frame_rate = rate;
        }
        if let Some(pix_fmt) = self.pix_fmt {
            config.pixel_format = pix_fmt;
        }
        if let Some(out_pix_fmt) = self.out_pix_fmt {
            config.output.pixel_format = out_pix_fmt;
        }
        if self.input_format.is_some() {
            config.input_format = self.input_format;
        }
        if self.size.is_some() {
            config.size = self.size;
        }
        if self.max_frames.is_some() {
            config.max_frames = self.max_frames;
        }
        if self.frame_timeout_ms.is_some() {
            config.frame_timeout_ms = self.frame_timeout_ms;
        }
        if let Some(pipe_frames) = self.pipe_frames {
            config.pipe_frames = pipe_frames;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_pipe", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

/// Drives `run` to completion. The first interrupt cancels it; a second one
/// gives up waiting and returns `None`.
async fn supervise<F, I, S>(
    run: F,
    cancel: CancellationToken,
    mut interrupt: I,
) -> Option<F::Output>
where
    F: Future,
    I: FnMut() -> S,
    S: Future<Output = ()>,
{
    tokio::pin!(run);
    loop {
        tokio::select! {
            result = &mut run => return Some(result),
            _ = interrupt() => {
                if cancel.is_cancelled() {
                    log::warn!("interrupted again, abandoning relay");
                    return None;
                }
                log::info!("interrupt received, stopping relay (again to force)");
                cancel.cancel();
            },
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let pipeline = match media::pipe::build(&config, cancel.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Returning drops the runtime, which kills any child still running.
    match supervise(pipeline.run(), cancel, ctrl_c).await {
        Some(Ok(_)) => ExitCode::SUCCESS,
        Some(Err(_)) => ExitCode::FAILURE,
        None => ExitCode::from(130),
    }
}
