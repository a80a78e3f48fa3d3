use std::{fmt, io, time::Duration};

/// Pipeline segment an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Probe,
    Decode,
    Bridge,
    Transform,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Probe => "probe",
            Stage::Decode => "decode",
            Stage::Bridge => "bridge",
            Stage::Transform => "transform",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot probe {source_id}: {reason}")]
    Probe { source_id: String, reason: String },

    #[error("libav initialisation failed: {reason}")]
    LibavInit { reason: String },

    #[error("invalid stream geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("{stage} process `{program}` failed to launch: {source}")]
    ProcessLaunch {
        stage: Stage,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage} process `{program}` exited abnormally ({})", describe_exit(.code))]
    ProcessRuntime {
        stage: Stage,
        program: String,
        code: Option<i32>,
    },

    #[error("{stage} pipe i/o failed: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    #[error("truncated frame: read {read} of {expected} bytes")]
    FrameTruncation { read: usize, expected: usize },

    #[error("short frame write: wrote {written} of {expected} bytes")]
    FrameWrite {
        written: usize,
        expected: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("no frame progress within {0:?}")]
    FrameTimeout(Duration),

    #[error("transform changed frame length from {expected} to {actual} bytes")]
    TransformDimension { expected: usize, actual: usize },

    #[error("transform failed on frame {seq}: {reason}")]
    Transform { seq: u64, reason: String },

    #[error("transform setup failed: {reason}")]
    TransformInit { reason: String },

    #[error("{stage} stopped without reporting a result")]
    StageAborted { stage: Stage },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Probe { .. }
            | PipelineError::LibavInit { .. }
            | PipelineError::InvalidGeometry { .. } => Stage::Probe,
            PipelineError::ProcessLaunch { stage, .. }
            | PipelineError::ProcessRuntime { stage, .. }
            | PipelineError::Io { stage, .. }
            | PipelineError::StageAborted { stage } => *stage,
            PipelineError::FrameTruncation { .. }
            | PipelineError::FrameWrite { .. }
            | PipelineError::FrameTimeout(_) => Stage::Bridge,
            PipelineError::TransformDimension { .. }
            | PipelineError::Transform { .. }
            | PipelineError::TransformInit { .. } => Stage::Transform,
        }
    }

    /// True when the failure only reflects that the other end of a pipe went away.
    pub fn is_peer_closed(&self) -> bool {
        let io = match self {
            PipelineError::Io { source, .. } => Some(source),
            PipelineError::FrameWrite { source, .. } => source.as_ref(),
            _ => None,
        };
        matches!(
            io.map(io::Error::kind),
            Some(io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
        )
    }
}
