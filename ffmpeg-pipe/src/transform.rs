//! Per-frame processing between decode and encode.
//!
//! A transform receives one frame and must hand back a frame of the same
//! geometry. The bridge rejects any output whose length differs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::PipelineError, frame::Frame, geometry::StreamGeometry};

pub trait FrameTransform: Send + 'static {
    fn name(&self) -> &str;

    fn apply(&mut self, frame: Frame) -> Result<Frame, PipelineError>;
}

/// Passes frames through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl FrameTransform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&mut self, frame: Frame) -> Result<Frame, PipelineError> {
        Ok(frame)
    }
}

/// Divides every byte by a constant, darkening (or graying) the picture.
#[derive(Debug, Clone, Copy)]
pub struct Dim {
    divisor: u8,
}

impl Dim {
    pub fn new(divisor: u8) -> Result<Self, PipelineError> {
        if divisor == 0 {
            return Err(PipelineError::TransformInit {
                reason: "dim divisor must be non-zero".to_string(),
            });
        }
        Ok(Self { divisor })
    }
}

impl FrameTransform for Dim {
    fn name(&self) -> &str {
        "dim"
    }

    fn apply(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        for b in frame.data_mut() {
            *b /= self.divisor;
        }
        Ok(frame)
    }
}

/// Rectangle of interest in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub label: Option<String>,
}

/// Finds regions of interest in a frame.
pub trait RegionDetector: Send + 'static {
    fn detect(
        &mut self,
        frame: &Frame,
        geometry: &StreamGeometry,
    ) -> Result<Vec<Region>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct RegionModel {
    regions: Vec<Region>,
}

/// Detector backed by a model file listing fixed regions.
///
/// ```json
/// { "regions": [ { "x": 40, "y": 30, "width": 64, "height": 64, "label": "Human" } ] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct FixedRegions {
    regions: Vec<Region>,
}

impl FixedRegions {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    /// Loads the model; a missing or malformed file fails at startup, not per frame.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::TransformInit {
            reason: format!("read region model {}: {}", path.display(), e),
        })?;
        let model: RegionModel =
            serde_json::from_str(&text).map_err(|e| PipelineError::TransformInit {
                reason: format!("parse region model {}: {}", path.display(), e),
            })?;
        log::info!(
            "loaded {} regions from {}",
            model.regions.len(),
            path.display()
        );
        Ok(Self::new(model.regions))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

impl RegionDetector for FixedRegions {
    fn detect(
        &mut self,
        _frame: &Frame,
        _geometry: &StreamGeometry,
    ) -> Result<Vec<Region>, PipelineError> {
        Ok(self.regions.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotationStyle {
    /// RGB; converted to the stream's pixel format when drawing.
    pub color: [u8; 3],
    pub thickness: u32,
    pub label_height: u32,
    /// Label tab width per label character.
    pub glyph_width: u32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            color: [0, 0, 255],
            thickness: 3,
            label_height: 12,
            glyph_width: 7,
        }
    }
}

/// Draws an outline around every detected region, with a label tab above it.
pub struct Annotate<D> {
    geometry: StreamGeometry,
    detector: D,
    style: AnnotationStyle,
}

impl<D: RegionDetector> Annotate<D> {
    pub fn new(geometry: StreamGeometry, detector: D) -> Self {
        Self {
            geometry,
            detector,
            style: AnnotationStyle::default(),
        }
    }

    pub fn with_style(mut self, style: AnnotationStyle) -> Self {
        self.style = style;
        self
    }

    fn draw_region(&self, data: &mut [u8], region: &Region) {
        let (width, height) = (self.geometry.width(), self.geometry.height());
        if region.x >= width || region.y >= height || region.width == 0 || region.height == 0 {
            return;
        }
        let x1 = region.x.saturating_add(region.width).min(width);
        let y1 = region.y.saturating_add(region.height).min(height);
        let t = self.style.thickness.max(1);

        // top, bottom, left, right
        self.fill(data, region.x, region.y, x1, region.y.saturating_add(t).min(y1));
        self.fill(data, region.x, y1.saturating_sub(t).max(region.y), x1, y1);
        self.fill(data, region.x, region.y, region.x.saturating_add(t).min(x1), y1);
        self.fill(data, x1.saturating_sub(t).max(region.x), region.y, x1, y1);

        if let Some(label) = region.label.as_deref().filter(|l| !l.is_empty()) {
            let tab_width = (label.chars().count() as u32)
                .saturating_mul(self.style.glyph_width)
                .saturating_add(t.saturating_mul(2));
            let tab_x1 = region.x.saturating_add(tab_width).min(width);
            // Above the region when there is room, otherwise inside its top edge.
            let (tab_y0, tab_y1) = if region.y >= self.style.label_height {
                (region.y - self.style.label_height, region.y)
            } else {
                (region.y, region.y.saturating_add(self.style.label_height).min(y1))
            };
            self.fill(data, region.x, tab_y0, tab_x1, tab_y1);
        }
    }

    /// Fills the half-open rectangle [x0, x1) x [y0, y1), already clipped to the frame.
    fn fill(&self, data: &mut [u8], x0: u32, y0: u32, x1: u32, y1: u32) {
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let format = self.geometry.pixel_format();
        let bpp = format.bytes_per_pixel();
        let pixel = format.encode_color(self.style.color);
        for y in y0..y1 {
            let start = self.geometry.pixel_offset(x0, y);
            let end = self.geometry.pixel_offset(x1, y);
            for chunk in data[start..end].chunks_exact_mut(bpp) {
                chunk.copy_from_slice(&pixel[..bpp]);
            }
        }
    }
}

impl<D: RegionDetector> FrameTransform for Annotate<D> {
    fn name(&self) -> &str {
        "annotate"
    }

    fn apply(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        if frame.len() != self.geometry.frame_len() {
            return Err(PipelineError::TransformDimension {
                expected: self.geometry.frame_len(),
                actual: frame.len(),
            });
        }
        let regions = self.detector.detect(&frame, &self.geometry)?;
        if !regions.is_empty() {
            log::debug!("frame {}: found {} regions", frame.seq(), regions.len());
        }
        for region in &regions {
            self.draw_region(frame.data_mut(), region);
        }
        Ok(frame)
    }
}
