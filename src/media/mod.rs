//! Relay wiring: one config in, one ffmpeg-pipe pipeline out.
//!
//! Data Flow:
//! ```text
//!  --size? ──► FixedGeometry ─┐
//!                             ├─► StreamGeometry ─► transform (annotate | dim | none)
//!  source ──► ffprobe ────────┘                           │
//!                                                         ▼
//!  source ──► ffmpeg (decode) ══ raw ══► bridge ══ raw ══► ffmpeg (encode) ──► sink
//! ```

pub mod pipe;
