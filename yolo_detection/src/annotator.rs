use crate::{font::LabelFont, service::Detection};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};

const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const OUTLINE_WIDTH: u32 = 2;
const LABEL_PADDING: i32 = 2;

/// Draws detection boxes and their labels onto images.
#[derive(Clone)]
pub struct Annotator {
    font: LabelFont,
    highlight: Rgb<u8>,
    text: Rgb<u8>,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(LabelFont::default())
    }
}

impl Annotator {
    pub fn new(font: LabelFont) -> Self {
        Self {
            font,
            highlight: HIGHLIGHT_COLOR,
            text: TEXT_COLOR,
        }
    }

    pub fn label(detection: &Detection) -> String {
        format!("{} {:.2}", detection.class_name, detection.confidence)
    }

    /// Returns an annotated copy of `image`; the input is left untouched.
    pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut annotated = image.clone();
        for detection in detections {
            self.draw_detection(&mut annotated, detection);
        }
        annotated
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let (width, height) = image.dimensions();

        // Edges are clamped just past the canvas, so off-canvas edges stay hidden.
        let margin = OUTLINE_WIDTH as i64 + 1;
        let clamp_x = |v: i64| v.clamp(-margin, width as i64 + margin);
        let clamp_y = |v: i64| v.clamp(-margin, height as i64 + margin);

        // The box spans (x, y) to (x + w, y + h) inclusive; the outline grows inward.
        let (x, y) = (detection.x as i64, detection.y as i64);
        let (x1, y1) = (clamp_x(x), clamp_y(y));
        let (x2, y2) = (
            clamp_x(x + detection.w as i64),
            clamp_y(y + detection.h as i64),
        );
        for inset in 0..OUTLINE_WIDTH as i64 {
            let rect_w = x2 - x1 + 1 - 2 * inset;
            let rect_h = y2 - y1 + 1 - 2 * inset;
            if rect_w <= 0 || rect_h <= 0 {
                break;
            }
            let rect = Rect::at((x1 + inset) as i32, (y1 + inset) as i32)
                .of_size(rect_w as u32, rect_h as u32);
            draw_hollow_rect_mut(image, rect, self.highlight);
        }

        let label = Self::label(detection);
        let (text_w, text_h) = self.font.text_size(&label);

        // Sits directly above the box and may extend past the top edge.
        let padding = LABEL_PADDING as i64;
        let background_w = text_w as i64 + 2 * padding + 1;
        let background_h = text_h as i64 + 2 * padding + 1;
        let background_top = y - text_h as i64 - 2 * padding;
        if x >= width as i64
            || background_top >= height as i64
            || x + background_w <= 0
            || background_top + background_h <= 0
        {
            return;
        }

        let background = Rect::at(x as i32, background_top as i32)
            .of_size(background_w as u32, background_h as u32);
        draw_filled_rect_mut(image, background, self.highlight);

        self.font.draw_text(
            image,
            self.text,
            (x + padding) as i32,
            (background_top + padding) as i32,
            &label,
        );
    }
}
