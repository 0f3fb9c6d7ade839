//! On-the-fly training augmentation.
//!
//! Each sample draws a random rotation, shift, shear and per-axis zoom,
//! composed into one affine map about the image centre, plus an optional
//! horizontal flip. Out-of-frame pixels replicate the nearest edge.

use crate::alignment::{warp_affine, Affine, Fill};
use image::{imageops, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Maximum rotation in degrees (either direction).
    pub rotation_degrees: f32,
    /// Maximum horizontal shift as a fraction of width.
    pub width_shift: f32,
    /// Maximum vertical shift as a fraction of height.
    pub height_shift: f32,
    /// Maximum shear angle in degrees.
    pub shear_degrees: f32,
    /// Zoom factors are drawn per axis from `[1 - zoom, 1 + zoom]`.
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            shear_degrees: 0.2,
            zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

impl AugmentConfig {
    /// No geometric change at all.
    pub fn disabled() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            shear_degrees: 0.0,
            zoom: 0.0,
            horizontal_flip: false,
        }
    }

    fn is_identity(&self) -> bool {
        self.rotation_degrees == 0.0
            && self.width_shift == 0.0
            && self.height_shift == 0.0
            && self.shear_degrees == 0.0
            && self.zoom == 0.0
    }
}

/// Produce a randomly transformed copy of `image` with the same dimensions.
pub fn augment<R: Rng + ?Sized>(image: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
    let mut out = if config.is_identity() {
        image.clone()
    } else {
        let m = random_transform(image.width(), image.height(), config, rng);
        warp_affine(image, &m, image.width(), image.height(), Fill::Nearest)
    };

    if config.horizontal_flip && rng.gen_bool(0.5) {
        imageops::flip_horizontal_in_place(&mut out);
    }
    out
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, bound: f32) -> f32 {
    let bound = bound.abs();
    rng.gen_range(-bound..=bound)
}

/// Output → source map: `src = C + T + R·S·Z · (dst − C)`.
fn random_transform<R: Rng + ?Sized>(
    width: u32,
    height: u32,
    config: &AugmentConfig,
    rng: &mut R,
) -> Affine {
    let theta = symmetric(rng, config.rotation_degrees).to_radians();
    let shear = symmetric(rng, config.shear_degrees).to_radians();
    let tx = symmetric(rng, config.width_shift) * width as f32;
    let ty = symmetric(rng, config.height_shift) * height as f32;
    let zx = 1.0 + symmetric(rng, config.zoom);
    let zy = 1.0 + symmetric(rng, config.zoom);

    let (sin_t, cos_t) = theta.sin_cos();
    let rotation = [[cos_t, -sin_t], [sin_t, cos_t]];
    let shearing = [[1.0, -shear.sin()], [0.0, shear.cos()]];
    let zooming = [[zx, 0.0], [0.0, zy]];
    let l = mul2(mul2(rotation, shearing), zooming);

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    [
        l[0][0],
        l[0][1],
        cx + tx - l[0][0] * cx - l[0][1] * cy,
        l[1][0],
        l[1][1],
        cy + ty - l[1][0] * cx - l[1][1] * cy,
    ]
}

fn mul2(a: [[f32; 2]; 2], b: [[f32; 2]; 2]) -> [[f32; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 77]))
    }

    #[test]
    fn test_disabled_is_identity() {
        let img = gradient(12, 9);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(augment(&img, &AugmentConfig::disabled(), &mut rng), img);
    }

    #[test]
    fn test_preserves_dimensions() {
        let img = gradient(16, 10);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(augment(&img, &AugmentConfig::default(), &mut rng).dimensions(), (16, 10));
        }
    }

    #[test]
    fn test_uniform_image_stays_uniform() {
        // Nearest fill means no black borders appear.
        let img = RgbImage::from_pixel(16, 16, Rgb([40, 80, 120]));
        let mut rng = StdRng::seed_from_u64(3);
        let out = augment(&img, &AugmentConfig::default(), &mut rng);
        assert!(out.pixels().all(|p| p.0 == [40, 80, 120]));
    }

    #[test]
    fn test_flip_only() {
        let img = gradient(8, 4);
        let config = AugmentConfig { horizontal_flip: true, ..AugmentConfig::disabled() };
        let mut flipped = img.clone();
        imageops::flip_horizontal_in_place(&mut flipped);

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let out = augment(&img, &config, &mut rng);
            assert!(out == img || out == flipped);
        }
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let img = gradient(16, 16);
        let a = augment(&img, &AugmentConfig::default(), &mut StdRng::seed_from_u64(42));
        let b = augment(&img, &AugmentConfig::default(), &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_transform_fixes_centre_without_shift() {
        let config = AugmentConfig {
            width_shift: 0.0,
            height_shift: 0.0,
            ..AugmentConfig::default()
        };
        let m = random_transform(21, 21, &config, &mut StdRng::seed_from_u64(5));
        let (cx, cy) = (10.0f32, 10.0f32);
        let sx = m[0] * cx + m[1] * cy + m[2];
        let sy = m[3] * cx + m[4] * cy + m[5];
        assert!((sx - cx).abs() < 1e-3 && (sy - cy).abs() < 1e-3, "({sx}, {sy})");
    }
}
