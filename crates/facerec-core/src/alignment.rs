//! Face alignment via Umeyama similarity transform.
//!
//! Maps five detected landmarks onto the canonical 112×112 ArcFace template
//! (rotation + uniform scale + translation) using a closed-form 2×2 SVD, and
//! warps the face region into an aligned crop.

use crate::types::{AffineMatrix, CanonicalTemplate, Frame, LandmarkSet};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const ARCFACE_TEMPLATE_112: CanonicalTemplate = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Mean squared distance (px²) below which the source points count as coincident.
const MIN_SOURCE_VARIANCE: f64 = 1e-6;
/// Singular values below this are treated as zero when recovering U.
const SINGULAR_EPS: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("degenerate landmarks: source variance {variance:e} px² is too small to estimate a transform")]
    DegenerateInput { variance: f64 },
    #[error("landmark coordinates must be finite")]
    NonFinite,
}

type Mat2 = [[f64; 2]; 2];

/// `A = U · diag(s) · Vᵀ` with `s[0] >= s[1] >= 0`.
#[derive(Debug, Clone, Copy)]
struct Svd2 {
    u: Mat2,
    s: [f64; 2],
    v: Mat2,
}

fn det2(m: &Mat2) -> f64 {
    m[0][0] * m[1][1] - m[0][1] * m[1][0]
}

/// Closed-form SVD of a 2×2 matrix.
///
/// V comes from the eigen-decomposition of AᵀA: its principal axis sits at
/// θ = ½·atan2(2q, p − r) and the eigenvalues are mean ± radius of the
/// quadratic form. U is recovered column-wise from A·vᵢ / sᵢ. The second
/// column of U is always ±perp(u₁) so U stays orthonormal even when A is
/// rank-deficient; its sign follows A·v₂ and is left at +1 when s₂ ≈ 0.
fn svd22(a: &Mat2) -> Svd2 {
    let [[a00, a01], [a10, a11]] = *a;

    // AᵀA = | p q |
    //       | q r |
    let p = a00 * a00 + a10 * a10;
    let q = a00 * a01 + a10 * a11;
    let r = a01 * a01 + a11 * a11;

    let theta = 0.5 * (2.0 * q).atan2(p - r);
    let (sin_t, cos_t) = theta.sin_cos();

    let mean = 0.5 * (p + r);
    let radius = (0.5 * (p - r)).hypot(q);
    let s1 = (mean + radius).sqrt();
    let s2 = (mean - radius).max(0.0).sqrt();

    // Columns v₁ = (cos θ, sin θ), v₂ = (−sin θ, cos θ).
    let v = [[cos_t, -sin_t], [sin_t, cos_t]];

    let (mut u1x, mut u1y) = if s1 > SINGULAR_EPS {
        ((a00 * cos_t + a01 * sin_t) / s1, (a10 * cos_t + a11 * sin_t) / s1)
    } else {
        (1.0, 0.0)
    };
    let norm = u1x.hypot(u1y);
    if norm > SINGULAR_EPS {
        u1x /= norm;
        u1y /= norm;
    }

    let (px, py) = (-u1y, u1x);
    let av2 = (a01 * cos_t - a00 * sin_t, a11 * cos_t - a10 * sin_t);
    let sign = if s2 > SINGULAR_EPS && av2.0 * px + av2.1 * py < 0.0 {
        -1.0
    } else {
        1.0
    };

    Svd2 {
        u: [[u1x, sign * px], [u1y, sign * py]],
        s: [s1, s2],
        v,
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f64, f64) {
    let (sx, sy) = points
        .iter()
        .fold((0.0f64, 0.0f64), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
    (sx / points.len() as f64, sy / points.len() as f64)
}

/// Estimate the similarity transform mapping `src` landmarks onto `dst`.
///
/// Umeyama least-squares: `R = U·D·Vᵀ` with `D = diag(1, sign(det U · det V))`,
/// which keeps `det(R) = +1` for every input, including collinear and
/// mirrored point sets. Fails only when the source points coincide.
pub fn estimate(src: &LandmarkSet, dst: &CanonicalTemplate) -> Result<AffineMatrix, AlignmentError> {
    if src
        .iter()
        .chain(dst.iter())
        .any(|&(x, y)| !x.is_finite() || !y.is_finite())
    {
        return Err(AlignmentError::NonFinite);
    }

    let n = src.len() as f64;
    let (smx, smy) = centroid(src);
    let (dmx, dmy) = centroid(dst);

    // Cov = (1/n) · Dst_cᵀ · Src_c
    let mut cov: Mat2 = [[0.0; 2]; 2];
    let mut src_var = 0.0f64;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx as f64 - smx, sy as f64 - smy);
        let (dx, dy) = (dx as f64 - dmx, dy as f64 - dmy);
        cov[0][0] += dx * sx;
        cov[0][1] += dx * sy;
        cov[1][0] += dy * sx;
        cov[1][1] += dy * sy;
        src_var += sx * sx + sy * sy;
    }
    for row in cov.iter_mut() {
        for c in row.iter_mut() {
            *c /= n;
        }
    }
    src_var /= n;

    if src_var < MIN_SOURCE_VARIANCE {
        return Err(AlignmentError::DegenerateInput { variance: src_var });
    }

    let Svd2 { u, s, v } = svd22(&cov);
    let d = if det2(&u) * det2(&v) < 0.0 { -1.0 } else { 1.0 };

    let mut rot: Mat2 = [[0.0; 2]; 2];
    for (i, row) in rot.iter_mut().enumerate() {
        for (j, c) in row.iter_mut().enumerate() {
            *c = u[i][0] * v[j][0] + d * u[i][1] * v[j][1];
        }
    }

    let scale = (s[0] + d * s[1]) / src_var;
    let tx = dmx - scale * (rot[0][0] * smx + rot[0][1] * smy);
    let ty = dmy - scale * (rot[1][0] * smx + rot[1][1] * smy);

    Ok(AffineMatrix {
        m: [
            [(scale * rot[0][0]) as f32, (scale * rot[0][1]) as f32, tx as f32],
            [(scale * rot[1][0]) as f32, (scale * rot[1][1]) as f32, ty as f32],
        ],
    })
}

/// Estimate the transform onto [`ARCFACE_TEMPLATE_112`].
pub fn estimate_112(landmarks: &LandmarkSet) -> Result<AffineMatrix, AlignmentError> {
    estimate(landmarks, &ARCFACE_TEMPLATE_112)
}

/// Apply a 2×3 affine warp, producing an `out_size`×`out_size` RGB crop.
///
/// Backward-maps every output pixel through the inverse transform with
/// bilinear interpolation. Out-of-bounds pixels are filled with 0 (black);
/// a singular matrix yields an all-black crop.
pub fn warp_affine(frame: &Frame, matrix: &AffineMatrix, out_size: usize) -> Vec<u8> {
    const C: usize = Frame::CHANNELS;
    let mut output = vec![0u8; out_size * out_size * C];

    let Some(inv) = matrix.invert() else {
        return output;
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = inv.apply((ox as f32, oy as f32));

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i64, y: i64| frame.pixel(x, y).unwrap_or([0; 3]);
            let (p00, p10) = (sample(x0, y0), sample(x0 + 1, y0));
            let (p01, p11) = (sample(x0, y0 + 1), sample(x0 + 1, y0 + 1));

            let base = (oy * out_size + ox) * C;
            for ch in 0..C {
                let val = p00[ch] as f32 * (1.0 - fx) * (1.0 - fy)
                    + p10[ch] as f32 * fx * (1.0 - fy)
                    + p01[ch] as f32 * (1.0 - fx) * fy
                    + p11[ch] as f32 * fx * fy;
                output[base + ch] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}
