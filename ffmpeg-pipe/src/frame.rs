use std::fmt::{Display, Formatter};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{PipelineError, Stage},
    geometry::StreamGeometry,
};

/// One raw picture plus its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    seq: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            data: data.into(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Frame {{ seq: {}, data: {} }}", self.seq, self.data.len())
    }
}

/// Reslices a byte stream into frames of exactly `frame_len` bytes.
///
/// Only the frame being read is buffered.
pub struct FrameReader<R> {
    inner: R,
    frame_len: usize,
    next_seq: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, geometry: &StreamGeometry) -> Self {
        Self {
            inner,
            frame_len: geometry.frame_len(),
            next_seq: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Returns the next frame, or `None` once the stream ends on a frame boundary.
    ///
    /// A stream ending part way through a frame is a [`PipelineError::FrameTruncation`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let mut buf = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < self.frame_len {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|source| PipelineError::Io {
                    stage: Stage::Bridge,
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < self.frame_len {
            return Err(PipelineError::FrameTruncation {
                read: filled,
                expected: self.frame_len,
            });
        }

        let frame = Frame::new(self.next_seq, buf);
        self.next_seq += 1;
        Ok(Some(frame))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes whole frames, reporting how far a failed write got.
pub struct FrameWriter<W> {
    inner: W,
    frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, geometry: &StreamGeometry) -> Self {
        Self {
            inner,
            frame_len: geometry.frame_len(),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let data = frame.data();
        let mut written = 0;
        while written < data.len() {
            match self.inner.write(&data[written..]).await {
                Ok(0) => {
                    return Err(PipelineError::FrameWrite {
                        written,
                        expected: self.frame_len,
                        source: None,
                    });
                }
                Ok(n) => written += n,
                Err(e) => {
                    return Err(PipelineError::FrameWrite {
                        written,
                        expected: self.frame_len,
                        source: Some(e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Flushes and closes the underlying stream; readers observe end of stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
