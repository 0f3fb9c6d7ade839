//! Face alignment and affine warping of RGB images.
//!
//! Faces are aligned to a canonical square crop with a 4-DOF similarity
//! transform estimated from five landmarks. The same warp is used by the
//! training augmentation pipeline.

use image::{Rgb, RgbImage};

/// Canonical landmark template for a 112×112 aligned face.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// 2×3 affine matrix `[a, b, c, d, e, f]` mapping `(x, y)` to
/// `(a·x + b·y + c, d·x + e·y + f)`.
pub type Affine = [f32; 6];

/// How output pixels that map outside the source are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Constant black.
    Black,
    /// Replicate the nearest edge pixel.
    Nearest,
}

/// Estimate the similarity transform (scale, rotation, translation) taking
/// `src` landmarks onto `dst` in the least-squares sense.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Affine {
    // Unknowns [a, b, tx, ty]; each correspondence contributes two rows:
    //   sx·a − sy·b + tx = dx
    //   sy·a + sx·b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. Degenerate systems yield the
/// identity scale with no translation.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(a: [[f32; 4]; 4], b: [f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    x
}

/// Invert an affine matrix. `None` when its linear part is singular.
pub fn invert_affine(m: &Affine) -> Option<Affine> {
    let [a, b, c, d, e, f] = *m;
    let det = a * e - b * d;
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let (ia, ib, id, ie) = (e * inv, -b * inv, -d * inv, a * inv);
    Some([ia, ib, -(ia * c + ib * f), id, ie, -(id * c + ie * f)])
}

/// Warp `src` into a `out_w × out_h` image.
///
/// `dst_to_src` maps each output pixel position to the source position it
/// samples; sampling is bilinear.
pub fn warp_affine(
    src: &RgbImage,
    dst_to_src: &Affine,
    out_w: u32,
    out_h: u32,
    fill: Fill,
) -> RgbImage {
    let (sw, sh) = (src.width() as i64, src.height() as i64);
    let [a, b, c, d, e, f] = *dst_to_src;

    let sample = |x: i64, y: i64| -> Option<[f32; 3]> {
        let (x, y) = match fill {
            Fill::Black if x < 0 || y < 0 || x >= sw || y >= sh => return None,
            Fill::Black => (x, y),
            Fill::Nearest => (x.clamp(0, sw - 1), y.clamp(0, sh - 1)),
        };
        let p = src.get_pixel(x as u32, y as u32);
        Some([p[0] as f32, p[1] as f32, p[2] as f32])
    };

    let mut out = RgbImage::new(out_w, out_h);
    if sw == 0 || sh == 0 {
        return out;
    }

    for oy in 0..out_h {
        for ox in 0..out_w {
            let (fx_out, fy_out) = (ox as f32, oy as f32);
            let sx = a * fx_out + b * fy_out + c;
            let sy = d * fx_out + e * fy_out + f;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let taps = [
                (sample(x0, y0), (1.0 - fx) * (1.0 - fy)),
                (sample(x0 + 1, y0), fx * (1.0 - fy)),
                (sample(x0, y0 + 1), (1.0 - fx) * fy),
                (sample(x0 + 1, y0 + 1), fx * fy),
            ];

            let mut acc = [0.0f32; 3];
            for (px, w) in taps {
                if let Some(px) = px {
                    for ch in 0..3 {
                        acc[ch] += px[ch] * w;
                    }
                }
            }
            out.put_pixel(ox, oy, Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8)));
        }
    }

    out
}

/// Align a detected face to a canonical `size × size` crop.
///
/// The reference template is defined for 112×112 and scaled to `size`.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> RgbImage {
    let scale = size as f32 / REFERENCE_SIZE;
    let reference = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * scale, y * scale));

    let src_to_dst = estimate_similarity_transform(landmarks, &reference);
    match invert_affine(&src_to_dst) {
        Some(dst_to_src) => warp_affine(image, &dst_to_src, size, size, Fill::Black),
        None => RgbImage::new(size, size),
    }
}
