//! Image decoding and face cropping.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted for enrollment and recognition images.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported image type {0:?}: expected png, jpg or jpeg")]
    UnsupportedExtension(PathBuf),
    #[error("failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode encoded image bytes (any format the `image` crate recognises) to RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Read and decode an image file, enforcing [`ALLOWED_EXTENSIONS`].
pub fn open_image(path: &Path) -> Result<RgbImage, DecodeError> {
    if !has_allowed_extension(path) {
        return Err(DecodeError::UnsupportedExtension(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes)
}

pub fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Cut the face region out of an image. `None` if the box lies outside it.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = face.pixel_rect(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Resize to a square of side `size` with bilinear filtering.
pub fn resize_square(image: &RgbImage, size: u32) -> RgbImage {
    if image.width() == size && image.height() == size {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}

/// Planar CHW float layout with values rescaled to [0, 1].
pub fn to_chw_unit(image: &RgbImage) -> Vec<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let plane = w * h;
    let mut out = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = y as usize * w + x as usize;
        for c in 0..3 {
            out[c * plane + idx] = pixel[c] as f32 / 255.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let decoded = decode(&png_bytes(&img)).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(decode(b"definitely not an image"), Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_open_image_checks_extension() {
        let dir = tempfile::tempdir().unwrap();
        let gif = dir.path().join("face.gif");
        std::fs::write(&gif, b"GIF89a").unwrap();
        assert!(matches!(open_image(&gif), Err(DecodeError::UnsupportedExtension(_))));

        let missing = dir.path().join("missing.png");
        assert!(matches!(open_image(&missing), Err(DecodeError::Io { .. })));

        let ok = dir.path().join("face.PNG");
        std::fs::write(&ok, png_bytes(&RgbImage::new(2, 2))).unwrap();
        assert_eq!(open_image(&ok).unwrap().dimensions(), (2, 2));
    }

    #[test]
    fn test_crop_face_clipped() {
        let img = RgbImage::from_pixel(20, 10, Rgb([1, 2, 3]));
        let face = BoundingBox {
            x: 15.0,
            y: -5.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.9,
            landmarks: None,
        };
        let crop = crop_face(&img, &face).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
    }

    #[test]
    fn test_to_chw_unit_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let chw = to_chw_unit(&img);
        assert_eq!(chw, vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.0]);
    }
}
