use image::{DynamicImage, ImageReader};

use crate::error::{OcrError, Result};

const IMAGE_MEAN: f32 = 0.5;
const IMAGE_STD: f32 = 0.5;

/// Normalized image tensor in `[1, 3, height, width]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelValues {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

/// Decode image bytes of any supported format.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let reader = ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| OcrError::Image(format!("Failed to read image: {e}")))?;

    reader
        .decode()
        .map_err(|e| OcrError::Image(format!("Failed to decode image: {e}")))
}

/// Grayscale, square-resize and normalize an image for the vision encoder.
///
/// The gray value is replicated into all three channels so the encoder sees
/// the RGB input it was trained on.
pub fn pixel_values(image: &DynamicImage, image_size: u32) -> Result<PixelValues> {
    if image_size == 0 {
        return Err(OcrError::Config("image size must be positive".to_string()));
    }

    let gray = image.grayscale().to_rgb8();
    let resized = image::imageops::resize(
        &gray,
        image_size,
        image_size,
        image::imageops::FilterType::Triangle,
    );

    let (width, height) = resized.dimensions();
    let mut data = Vec::with_capacity((3 * width * height) as usize);
    for c in 0..3 {
        for pixel in resized.pixels() {
            data.push((pixel[c] as f32 / 255.0 - IMAGE_MEAN) / IMAGE_STD);
        }
    }

    Ok(PixelValues {
        data,
        shape: [1, 3, height as usize, width as usize],
    })
}

pub fn prepare(bytes: &[u8], image_size: u32) -> Result<PixelValues> {
    pixel_values(&decode_image(bytes)?, image_size)
}

/// Clean up raw decoder text: drop whitespace and spell out ellipses.
pub fn post_process(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace('\u{2026}', "...")
}
