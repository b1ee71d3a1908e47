//! Drawing surface abstraction for the live overlay.
//!
//! The detection loop only ever talks to [`Canvas`]; hosts plug in whatever
//! surface they render with. [`ImageCanvas`] is an RGBA raster backed by the
//! `image` crate, used headless and in tests.

use image::{Rgba, RgbaImage};

use crate::types::FaceBox;

/// Opaque RGB overlay colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(0xff, 0xff, 0xff);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, 0xff])
    }
}

/// Minimal 2D drawing contract used by the overlay renderer.
pub trait Canvas: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Resize the surface. Content is discarded, as with an HTML canvas.
    fn resize(&mut self, width: u32, height: u32);
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: FaceBox, color: Color, line_width: f32);
    fn fill_rect(&mut self, rect: FaceBox, color: Color);
    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color, font_px: f32);
    /// Rendered width of `text` in pixels.
    fn measure_text(&self, text: &str, font_px: f32) -> f32;
}

/// A caption placed on an [`ImageCanvas`].
#[derive(Debug, Clone, PartialEq)]
pub struct TextAnnotation {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub color: Color,
}

/// Average advance of a proportional sans-serif glyph, as a fraction of the
/// font size.
const GLYPH_ADVANCE: f32 = 0.6;

/// RGBA raster canvas. Shapes are rasterized; captions are kept as
/// annotations for the host to render with its own font stack.
pub struct ImageCanvas {
    image: RgbaImage,
    annotations: Vec<TextAnnotation>,
}

impl ImageCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            annotations: Vec::new(),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn annotations(&self) -> &[TextAnnotation] {
        &self.annotations
    }

    /// Pixel at (x, y), `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x < self.image.width() && y < self.image.height() {
            Some(self.image.get_pixel(x, y).0)
        } else {
            None
        }
    }

    /// True when nothing has been drawn since the last clear.
    pub fn is_blank(&self) -> bool {
        self.annotations.is_empty() && self.image.pixels().all(|p| p.0[3] == 0)
    }

    fn fill_region(&mut self, x0: f32, y0: f32, x1: f32, y1: f32, color: Color) {
        let w = self.image.width() as f32;
        let h = self.image.height() as f32;
        let xs = x0.max(0.0).floor() as u32;
        let ys = y0.max(0.0).floor() as u32;
        let xe = x1.min(w).ceil().max(0.0) as u32;
        let ye = y1.min(h).ceil().max(0.0) as u32;
        let px = color.to_rgba();
        for y in ys..ye {
            for x in xs..xe {
                self.image.put_pixel(x, y, px);
            }
        }
    }
}

impl Canvas for ImageCanvas {
    fn width(&self) -> u32 {
        self.image.width()
    }

    fn height(&self) -> u32 {
        self.image.height()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.image = RgbaImage::new(width, height);
        self.annotations.clear();
    }

    fn clear(&mut self) {
        for p in self.image.pixels_mut() {
            *p = Rgba([0, 0, 0, 0]);
        }
        self.annotations.clear();
    }

    fn stroke_rect(&mut self, rect: FaceBox, color: Color, line_width: f32) {
        let half = line_width.max(1.0) / 2.0;
        let (left, top) = (rect.x, rect.y);
        let (right, bottom) = (rect.x + rect.width, rect.y + rect.height);

        self.fill_region(left - half, top - half, right + half, top + half, color);
        self.fill_region(left - half, bottom - half, right + half, bottom + half, color);
        self.fill_region(left - half, top - half, left + half, bottom + half, color);
        self.fill_region(right - half, top - half, right + half, bottom + half, color);
    }

    fn fill_rect(&mut self, rect: FaceBox, color: Color) {
        self.fill_region(rect.x, rect.y, rect.x + rect.width, rect.y + rect.height, color);
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color, _font_px: f32) {
        self.annotations.push(TextAnnotation {
            text: text.to_string(),
            x,
            y,
            color,
        });
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        text.chars().count() as f32 * font_px * GLYPH_ADVANCE
    }
}
