use ab_glyph::{FontArc, PxScale};
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use std::path::Path;
use thiserror::Error;

const GLYPH_SIZE: u32 = 8;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("Failed to read font file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid font file {0}")]
    Invalid(String),
}

/// Font used for detection labels.
#[derive(Clone, Default)]
pub enum LabelFont {
    /// Built-in 8x8 bitmap font.
    #[default]
    Bitmap,
    TrueType { font: FontArc, scale: PxScale },
}

impl LabelFont {
    pub fn load(path: Option<&Path>, size: f32) -> Result<Self, FontError> {
        let Some(path) = path else {
            return Ok(LabelFont::Bitmap);
        };

        let data = std::fs::read(path).map_err(|source| FontError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontArc::try_from_vec(data)
            .map_err(|_| FontError::Invalid(path.display().to_string()))?;

        Ok(LabelFont::TrueType {
            font,
            scale: PxScale::from(size),
        })
    }

    /// Width and height in pixels of `text` once rendered.
    pub fn text_size(&self, text: &str) -> (u32, u32) {
        match self {
            LabelFont::Bitmap => (text.chars().count() as u32 * GLYPH_SIZE, GLYPH_SIZE),
            LabelFont::TrueType { font, scale } => text_size(*scale, font, text),
        }
    }

    /// Draws `text` with its top-left corner at `(x, y)`. Pixels outside the
    /// image are skipped.
    pub fn draw_text(&self, image: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
        match self {
            LabelFont::Bitmap => draw_bitmap_text(image, color, x, y, text),
            LabelFont::TrueType { font, scale } => {
                draw_text_mut(image, color, x, y, *scale, font, text)
            }
        }
    }
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or_default()
}

fn draw_bitmap_text(image: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
    let (width, height) = (image.width() as i64, image.height() as i64);

    for (index, c) in text.chars().enumerate() {
        let origin_x = x as i64 + index as i64 * GLYPH_SIZE as i64;
        for (row, bits) in glyph(c).iter().enumerate() {
            let py = y as i64 + row as i64;
            if py < 0 || py >= height {
                continue;
            }
            for bit in 0..GLYPH_SIZE {
                // bit 0 is the leftmost pixel
                if bits & (1 << bit) == 0 {
                    continue;
                }
                let px = origin_x + bit as i64;
                if px >= 0 && px < width {
                    image.put_pixel(px as u32, py as u32, color);
                }
            }
        }
    }
}
