//! Overlay geometry and detector tuning helpers.

use crate::canvas::{Canvas, Color};
use crate::types::{FaceAttributes, FaceBox};

// --- Detector input sizes (tiny detector requires multiples of 32) ---
pub const MIN_INPUT_SIZE: u32 = 160;
pub const MAX_INPUT_SIZE: u32 = 416;

/// (largest video dimension, detector input size) steps, checked in order.
const INPUT_SIZE_STEPS: [(u32, u32); 4] = [(240, 160), (480, 224), (720, 320), (1080, 384)];

const SMALL_INPUT_FACTOR: f32 = 1.1;
const LARGE_INPUT_FACTOR: f32 = 0.95;
const SMALL_INPUT_BELOW: u32 = 224;
const LARGE_INPUT_ABOVE: u32 = 384;

// --- Overlay styling ---
pub const RECOGNIZED_COLOR: Color = Color::rgb(0x4c, 0xaf, 0x50);
pub const UNKNOWN_COLOR: Color = Color::rgb(0xf4, 0x43, 0x36);
pub const NO_USERS_COLOR: Color = Color::rgb(0xff, 0x98, 0x00);
pub const BOX_LINE_WIDTH: f32 = 3.0;
const CAPTION_FONT_PX: f32 = 14.0;
const CAPTION_HEIGHT: f32 = 20.0;
const CAPTION_PADDING: f32 = 5.0;

pub const ATTRIBUTE_PANEL_COLOR: Color = Color::rgb(0x25, 0x63, 0xeb);
const PANEL_GAP: f32 = 10.0;
const PANEL_LINE_HEIGHT: f32 = 18.0;

/// Pick the detector input size for a negotiated video resolution.
///
/// Step function of the larger dimension: low-resolution video gets a small
/// input (fast, coarse), high-resolution video a large one, up to
/// [`MAX_INPUT_SIZE`].
pub fn optimal_input_size(video_width: u32, video_height: u32) -> u32 {
    let max_dimension = video_width.max(video_height);
    INPUT_SIZE_STEPS
        .iter()
        .find(|(limit, _)| max_dimension <= *limit)
        .map(|(_, size)| *size)
        .unwrap_or(MAX_INPUT_SIZE)
}

/// Relax the match threshold for small detector inputs and tighten it for
/// large ones. Never exceeds 1.0.
pub fn adjusted_threshold(base_threshold: f32, input_size: u32) -> f32 {
    let factor = if input_size < SMALL_INPUT_BELOW {
        SMALL_INPUT_FACTOR
    } else if input_size > LARGE_INPUT_ABOVE {
        LARGE_INPUT_FACTOR
    } else {
        1.0
    };
    (base_threshold * factor).min(1.0)
}

/// Match the drawing surface to the negotiated video resolution.
///
/// Zero dimensions (metadata not available yet) leave the canvas untouched.
pub fn resize_canvas(canvas: &mut dyn Canvas, video_width: u32, video_height: u32) {
    if video_width > 0 && video_height > 0 {
        canvas.resize(video_width, video_height);
    }
}

/// How a detection box is rendered.
#[derive(Debug, Clone)]
pub struct BoxStyle {
    pub color: Color,
    pub line_width: f32,
    pub label: Option<String>,
    pub distance: Option<f32>,
}

impl BoxStyle {
    pub fn new(color: Color) -> Self {
        Self {
            color,
            line_width: BOX_LINE_WIDTH,
            label: None,
            distance: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn distance(mut self, distance: f32) -> Self {
        self.distance = Some(distance);
        self
    }

    /// Caption text, or `None` when neither label nor distance is set.
    pub fn caption(&self) -> Option<String> {
        match (&self.label, self.distance) {
            (Some(label), Some(d)) => Some(format!("{label} ({d:.2})")),
            (Some(label), None) => Some(label.clone()),
            (None, Some(d)) => Some(format!("Unknown ({d:.2})")),
            (None, None) => None,
        }
    }
}

/// Stroke a face box and, when the style carries one, its caption band.
///
/// The caption sits above the box when there is room, otherwise below it.
pub fn draw_box(canvas: &mut dyn Canvas, bbox: &FaceBox, style: &BoxStyle) {
    canvas.stroke_rect(*bbox, style.color, style.line_width);

    let Some(text) = style.caption() else {
        return;
    };

    let text_width = canvas.measure_text(&text, CAPTION_FONT_PX);
    let baseline = if bbox.y > CAPTION_HEIGHT {
        bbox.y - CAPTION_PADDING
    } else {
        bbox.y + bbox.height + CAPTION_HEIGHT
    };

    let band = FaceBox {
        x: bbox.x,
        y: baseline - CAPTION_HEIGHT,
        width: text_width + 2.0 * CAPTION_PADDING,
        height: CAPTION_HEIGHT,
    };
    canvas.fill_rect(band, style.color);
    canvas.fill_text(
        &text,
        bbox.x + CAPTION_PADDING,
        baseline - CAPTION_PADDING,
        Color::WHITE,
        CAPTION_FONT_PX,
    );
}

/// Text lines of the attribute panel for one face.
///
/// The emotion line is omitted when the engine reported no expressions.
pub fn attribute_lines(score: f32, attributes: &FaceAttributes) -> Vec<String> {
    let mut lines = vec![
        format!("Confidence: {:.1}%", score * 100.0),
        format!("Age: {}", attributes.age.round() as i32),
        format!(
            "Gender: {} ({:.1}%)",
            attributes.gender,
            attributes.gender_probability * 100.0
        ),
    ];
    if let Some((expression, p)) = attributes.top_expression() {
        lines.push(format!("Emotion: {expression} ({:.1}%)", p * 100.0));
    }
    lines
}

/// Draw the attribute panel beside a face box.
///
/// The panel goes right of the box, or left of it when it would run off
/// the canvas.
pub fn draw_attributes(canvas: &mut dyn Canvas, bbox: &FaceBox, score: f32, attributes: &FaceAttributes) {
    let lines = attribute_lines(score, attributes);
    let text_width = lines
        .iter()
        .map(|line| canvas.measure_text(line, CAPTION_FONT_PX))
        .fold(0.0, f32::max);
    let panel_width = text_width + 2.0 * CAPTION_PADDING;

    let right = bbox.x + bbox.width + PANEL_GAP;
    let x = if right + panel_width <= canvas.width() as f32 {
        right
    } else {
        (bbox.x - PANEL_GAP - panel_width).max(0.0)
    };

    let panel = FaceBox {
        x,
        y: bbox.y,
        width: panel_width,
        height: lines.len() as f32 * PANEL_LINE_HEIGHT + CAPTION_PADDING,
    };
    canvas.fill_rect(panel, ATTRIBUTE_PANEL_COLOR);
    for (i, line) in lines.iter().enumerate() {
        canvas.fill_text(
            line,
            x + CAPTION_PADDING,
            bbox.y + (i + 1) as f32 * PANEL_LINE_HEIGHT,
            Color::WHITE,
            CAPTION_FONT_PX,
        );
    }
}

/// Human-readable byte count: `0 Bytes`, `512 Bytes`, `1.5 KB`, `2 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}
