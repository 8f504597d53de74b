//! Burned-in frame watermark: a timestamp line and an optional location line,
//! white over a dark shadow, drawn straight into the frame pixels.

use chrono::{DateTime, Local};
use image::{Rgba, RgbaImage};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const ADVANCE: u32 = GLYPH_W + 1;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// 5x7 bitmap, one byte per row, low five bits used (MSB = leftmost column).
/// Only digits and the punctuation of timestamps and coordinates are drawn; any other character renders as a box.
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        ' ' => [0x00; 7],
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}

/// Watermark layout. Lines are placed by their baseline.
#[derive(Debug, Clone, Copy)]
pub struct Watermark {
    pub x: u32,
    pub first_baseline: u32,
    pub line_gap: u32,
    pub scale: u32,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            x: 10,
            first_baseline: 30,
            line_gap: 20,
            scale: 2,
        }
    }
}

impl Watermark {
    /// Draw the timestamp and, if given, the location text.
    pub fn stamp(&self, frame: &mut RgbaImage, timestamp: &str, location: Option<&str>) {
        self.draw_line(frame, timestamp, self.first_baseline);
        if let Some(text) = location {
            self.draw_line(frame, text, self.first_baseline + self.line_gap);
        }
    }

    fn draw_line(&self, frame: &mut RgbaImage, text: &str, baseline: u32) {
        let scale = self.scale.max(1);
        let top = baseline.saturating_sub(GLYPH_H * scale);
        let shadow = (scale / 2).max(1);
        draw_text(frame, text, self.x + shadow, top + shadow, scale, SHADOW);
        draw_text(frame, text, self.x, top, scale, WHITE);
    }
}

fn draw_text(frame: &mut RgbaImage, text: &str, x: u32, y: u32, scale: u32, color: Rgba<u8>) {
    let (w, h) = frame.dimensions();
    for (i, c) in text.chars().enumerate() {
        let gx = x + i as u32 * ADVANCE * scale;
        if gx >= w {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                let px = gx + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (fx, fy) = (px + dx, py + dy);
                        if fx < w && fy < h {
                            frame.put_pixel(fx, fy, color);
                        }
                    }
                }
            }
        }
    }
}

/// Local wall time as printed on frames.
pub fn timestamp_text(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
