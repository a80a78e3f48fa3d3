//! Frame layout negotiated once per pipeline run.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Packed pixel formats the raw pipe can carry, named as ffmpeg names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
    Rgba,
    Bgra,
    Gray,
    Gray16le,
    Rgb565le,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 7] = [
        PixelFormat::Bgr24,
        PixelFormat::Rgb24,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Gray,
        PixelFormat::Gray16le,
        PixelFormat::Rgb565le,
    ];

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray => 1,
            PixelFormat::Gray16le | PixelFormat::Rgb565le => 2,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
        }
    }

    /// Value passed to ffmpeg's `-pix_fmt`.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Gray => "gray",
            PixelFormat::Gray16le => "gray16le",
            PixelFormat::Rgb565le => "rgb565le",
        }
    }

    /// Encodes an RGB color as one pixel of this format.
    ///
    /// Only the first `bytes_per_pixel()` bytes of the result are meaningful.
    pub fn encode_color(self, [r, g, b]: [u8; 3]) -> [u8; 4] {
        let luma = ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8;
        match self {
            PixelFormat::Bgr24 => [b, g, r, 0],
            PixelFormat::Rgb24 => [r, g, b, 0],
            PixelFormat::Rgba => [r, g, b, 0xff],
            PixelFormat::Bgra => [b, g, r, 0xff],
            PixelFormat::Gray => [luma, 0, 0, 0],
            PixelFormat::Gray16le => {
                let [lo, hi] = (luma as u16 * 257).to_le_bytes();
                [lo, hi, 0, 0]
            }
            PixelFormat::Rgb565le => {
                let packed = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
                let [lo, hi] = packed.to_le_bytes();
                [lo, hi, 0, 0]
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelFormat::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unsupported pixel format: {}", s))
    }
}

/// Width, height and pixel format of every frame in a run.
///
/// Construction validates the dimensions, so a value of this type always
/// describes a non-empty frame whose byte length fits in `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamGeometry {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    frame_len: usize,
}

impl StreamGeometry {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidGeometry { width, height };
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(pixel_format.bytes_per_pixel()))
            .ok_or_else(invalid)?;

        Ok(Self {
            width,
            height,
            pixel_format,
            frame_len,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Byte length of one frame: `width * height * bytes_per_pixel`.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Byte offset of the pixel at (`x`, `y`).
    pub fn pixel_offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.pixel_format.bytes_per_pixel()
    }

    /// `WxH`, as ffmpeg's `-s` expects it.
    pub fn size_arg(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for StreamGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}
