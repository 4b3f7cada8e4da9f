//! Corner-box frame annotation with per-emotion colours, confidence bars and
//! optional label text.

use ab_glyph::{FontVec, PxScale};
use emorecs_core::{Emotion, EmotionResult, FaceBox};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

const NO_RESULT_COLOR: Rgb<u8> = Rgb([200, 200, 200]);
const CORNER_MAX: u32 = 20;
const BAR_HEIGHT: u32 = 8;
const BAR_GAP: u32 = 2;
const LABEL_PX: u32 = 14;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("failed to read font {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not a usable font: {0}")]
    Invalid(String),
}

/// Load a TrueType/OpenType font for overlay labels.
pub fn load_label_font(path: &Path) -> Result<FontVec, FontError> {
    let bytes = std::fs::read(path).map_err(|source| FontError::Io {
        path: path.display().to_string(),
        source,
    })?;
    FontVec::try_from_vec(bytes).map_err(|e| FontError::Invalid(format!("{}: {e}", path.display())))
}

pub fn emotion_color(emotion: Emotion) -> Rgb<u8> {
    match emotion {
        Emotion::Angry => Rgb([255, 0, 0]),
        Emotion::Disgust => Rgb([255, 140, 0]),
        Emotion::Fear => Rgb([255, 105, 180]),
        Emotion::Happy => Rgb([0, 255, 0]),
        Emotion::Sad => Rgb([0, 165, 255]),
        Emotion::Surprise => Rgb([255, 255, 0]),
        Emotion::Neutral => Rgb([200, 200, 200]),
    }
}

/// Copy of `frame` with every face boxed.
///
/// `results[i]` belongs to `faces[i]`; a face without a result gets a plain
/// grey rectangle. With a `font`, each classified face is also labelled with
/// its emotion and confidence percentage.
pub fn annotate(
    frame: &RgbImage,
    faces: &[FaceBox],
    results: &[Option<EmotionResult>],
    font: Option<&FontVec>,
) -> RgbImage {
    let mut out = frame.clone();
    for (i, face) in faces.iter().enumerate() {
        let b = face.clamp_to(out.width(), out.height());
        if b.width == 0 || b.height == 0 {
            continue;
        }
        match results.get(i).and_then(Option::as_ref) {
            Some(result) => {
                let color = emotion_color(result.label);
                draw_corner_box(&mut out, &b, color);
                let bar_y = draw_confidence_bar(&mut out, &b, result.confidence, color);
                if let Some(font) = font {
                    draw_label(&mut out, &b, bar_y, result, font, color);
                }
            }
            None => {
                let rect = Rect::at(b.x as i32, b.y as i32).of_size(b.width, b.height);
                draw_hollow_rect_mut(&mut out, rect, NO_RESULT_COLOR);
            }
        }
    }
    out
}

/// Eight short strokes at the corners, two pixels thick.
fn draw_corner_box(img: &mut RgbImage, b: &FaceBox, color: Rgb<u8>) {
    let c = CORNER_MAX.min(b.width / 4).min(b.height / 4).max(1) as f32;
    let (x0, y0) = (b.x as f32, b.y as f32);
    let (x1, y1) = ((b.x + b.width - 1) as f32, (b.y + b.height - 1) as f32);

    let strokes = [
        ((x0, y0), (x0 + c, y0)),
        ((x0, y0), (x0, y0 + c)),
        ((x1, y0), (x1 - c, y0)),
        ((x1, y0), (x1, y0 + c)),
        ((x0, y1), (x0 + c, y1)),
        ((x0, y1), (x0, y1 - c)),
        ((x1, y1), (x1 - c, y1)),
        ((x1, y1), (x1, y1 - c)),
    ];

    for (start, end) in strokes {
        draw_line_segment_mut(img, start, end, color);
        // Second pass one pixel toward the box centre.
        let dx = if start.0 == x0 { 1.0 } else { -1.0 };
        let dy = if start.1 == y0 { 1.0 } else { -1.0 };
        let (s, e) = if start.1 == end.1 {
            ((start.0, start.1 + dy), (end.0, end.1 + dy))
        } else {
            ((start.0 + dx, start.1), (end.0 + dx, end.1))
        };
        draw_line_segment_mut(img, s, e, color);
    }
}

/// Filled bar above the box (inside it when there is no room) whose length
/// is the confidence share of the box width. Returns the bar's top row.
fn draw_confidence_bar(img: &mut RgbImage, b: &FaceBox, confidence: f32, color: Rgb<u8>) -> u32 {
    let width = ((b.width as f32 * confidence.clamp(0.0, 1.0)).round() as u32).max(1);
    let height = BAR_HEIGHT.min(b.height);
    let y = if b.y >= BAR_HEIGHT + BAR_GAP {
        b.y - BAR_HEIGHT - BAR_GAP
    } else {
        b.y
    };
    draw_filled_rect_mut(img, Rect::at(b.x as i32, y as i32).of_size(width, height), color);
    y
}

/// "happy 75%" above the bar, or just below it when the box touches the top.
fn draw_label(img: &mut RgbImage, b: &FaceBox, bar_y: u32, result: &EmotionResult, font: &FontVec, color: Rgb<u8>) {
    let text = format!("{} {:.0}%", result.label, result.confidence * 100.0);
    let y = if bar_y >= LABEL_PX + 1 {
        bar_y - LABEL_PX - 1
    } else {
        bar_y + BAR_HEIGHT.min(b.height) + 1
    };
    draw_text_mut(img, color, b.x as i32, y as i32, PxScale::from(LABEL_PX as f32), font, &text);
}
