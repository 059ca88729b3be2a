use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Image data is empty")]
    Empty,
    #[error("Unable to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Unable to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Decodes any supported container into an RGB pixel grid, dropping alpha.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let image = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(image::ImageError::IoError(e)))?
        .decode()
        .map_err(CodecError::Decode)?;

    Ok(image.to_rgb8())
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(CodecError::Encode)?;
    Ok(buf.into_inner())
}

pub fn to_png_data_uri(png: &[u8]) -> String {
    format!("{}{}", PNG_DATA_URI_PREFIX, STANDARD.encode(png))
}

/// Inverse of [`to_png_data_uri`]. Returns `None` for anything that is not
/// a base64 PNG data URI.
pub fn from_png_data_uri(uri: &str) -> Option<Vec<u8>> {
    let payload = uri.strip_prefix(PNG_DATA_URI_PREFIX)?;
    STANDARD.decode(payload).ok()
}
