use serde::{Deserialize, Serialize};

/// Five-point facial landmarks in source-image pixels:
/// [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type LandmarkSet = [(f32, f32); 5];

/// Target landmark positions for an aligned crop.
pub type CanonicalTemplate = [(f32, f32); 5];

/// Name reported when no enrolled identity clears the threshold.
pub const UNKNOWN_NAME: &str = "unknown";

/// 2×3 similarity transform `[scale·R | t]`, row-major.
///
/// ```text
/// | m[0][0]  m[0][1]  m[0][2] |
/// | m[1][0]  m[1][1]  m[1][2] |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineMatrix {
    pub m: [[f32; 3]; 2],
}

impl AffineMatrix {
    pub const IDENTITY: AffineMatrix = AffineMatrix {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    };

    /// Map a point through the transform.
    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let m = &self.m;
        (
            m[0][0] * x + m[0][1] * y + m[0][2],
            m[1][0] * x + m[1][1] * y + m[1][2],
        )
    }

    /// Uniform scale factor, i.e. sqrt(det) of the linear part.
    pub fn scale(&self) -> f32 {
        self.linear_det().abs().sqrt()
    }

    /// Determinant of the rotation part (the linear part with scale divided out).
    ///
    /// Returns 0.0 when the linear part has collapsed to zero.
    pub fn rotation_det(&self) -> f32 {
        let det = self.linear_det();
        if det.abs() < f32::EPSILON {
            0.0
        } else {
            det / det.abs()
        }
    }

    fn linear_det(&self) -> f32 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    /// Inverse transform, or `None` if the linear part is singular.
    pub fn invert(&self) -> Option<AffineMatrix> {
        let det = self.linear_det();
        if det.abs() < 1e-12 {
            return None;
        }
        let [[a, b, tx], [c, d, ty]] = self.m;
        let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
        Some(AffineMatrix {
            m: [
                [ia, ib, -(ia * tx + ib * ty)],
                [ic, id, -(ic * tx + id * ty)],
            ],
        })
    }

    /// Flattened `[a, b, tx, c, d, ty]`, the layout hardware warp builders take.
    pub fn to_array(&self) -> [f32; 6] {
        let [[a, b, tx], [c, d, ty]] = self.m;
        [a, b, tx, c, d, ty]
    }
}

/// An RGB8 image, pixels interleaved row-major (width * height * 3 bytes).
///
/// Only constructible through [`Frame::new`] or an [`image::RgbImage`], so the
/// buffer length always matches the dimensions.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        if data.len() != width as usize * height as usize * Self::CHANNELS {
            return None;
        }
        Some(Self { data, width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Pixel at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: i64, y: i64) -> Option<[u8; 3]> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        match self.data.get(idx..idx + Self::CHANNELS)? {
            &[r, g, b] => Some([r, g, b]),
            _ => None,
        }
    }
}

impl From<image::RgbImage> for Frame {
    fn from(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Bounding box of a detected face, as handed to the overlay collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<LandmarkSet>,
}

impl BoundingBox {
    /// Box enclosing `landmarks`, padded by `margin` times its larger side.
    ///
    /// Stands in for a detector box when only landmarks are known.
    pub fn around_landmarks(landmarks: &LandmarkSet, margin: f32) -> Self {
        let (mut x0, mut y0) = (f32::INFINITY, f32::INFINITY);
        let (mut x1, mut y1) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for &(x, y) in landmarks {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let pad = (x1 - x0).max(y1 - y0) * margin;
        Self {
            x: x0 - pad,
            y: y0 - pad,
            width: x1 - x0 + 2.0 * pad,
            height: y1 - y0 + 2.0 * pad,
            confidence: 1.0,
            landmarks: Some(*landmarks),
        }
    }
}

/// Result of searching a probe embedding against the feature database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Slot index of the matched entry, `None` when unknown.
    pub id: Option<usize>,
    /// Best cosine similarity observed in [-1, 1], reported even on a miss.
    pub score: f32,
    /// Label of the matched entry or [`UNKNOWN_NAME`].
    pub name: String,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self {
            id: None,
            score,
            name: UNKNOWN_NAME.to_string(),
        }
    }

    pub fn is_match(&self) -> bool {
        self.id.is_some()
    }

    /// Slot index with `-1` standing for "no match".
    pub fn id_or_sentinel(&self) -> i64 {
        self.id.map_or(-1, |slot| slot as i64)
    }

    /// Caption for the overlay collaborator, e.g. `"alice 0.87"`.
    pub fn overlay_text(&self) -> String {
        format!("{} {:.2}", self.name, self.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_apply() {
        let p = (12.5, -3.0);
        assert_eq!(AffineMatrix::IDENTITY.apply(p), p);
        assert_eq!(AffineMatrix::IDENTITY.scale(), 1.0);
        assert_eq!(AffineMatrix::IDENTITY.rotation_det(), 1.0);
    }

    #[test]
    fn test_invert_roundtrip() {
        // 30° rotation, scale 2, translation (5, -7)
        let (s, c) = (30f32.to_radians().sin() * 2.0, 30f32.to_radians().cos() * 2.0);
        let m = AffineMatrix {
            m: [[c, -s, 5.0], [s, c, -7.0]],
        };
        let inv = m.invert().unwrap();
        let p = (40.0, 17.0);
        let (x, y) = inv.apply(m.apply(p));
        assert!((x - p.0).abs() < 1e-4 && (y - p.1).abs() < 1e-4, "got ({x}, {y})");
        assert!((m.scale() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_invert_singular() {
        let m = AffineMatrix {
            m: [[0.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
        };
        assert!(m.invert().is_none());
        assert_eq!(m.rotation_det(), 0.0);
    }

    #[test]
    fn test_frame_rejects_bad_length() {
        assert!(Frame::new(vec![0; 11], 2, 2).is_none());
        let f = Frame::new(vec![7; 12], 2, 2).unwrap();
        assert_eq!(f.pixel(1, 1), Some([7, 7, 7]));
        assert_eq!(f.pixel(2, 0), None);
        assert_eq!(f.pixel(-1, 0), None);
        assert_eq!((f.width(), f.height(), f.data().len()), (2, 2, 12));
    }

    #[test]
    fn test_frame_from_image_keeps_layout() {
        let img = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 9]));
        let f = Frame::from(img);
        assert_eq!((f.width(), f.height()), (3, 2));
        assert_eq!(f.pixel(2, 1), Some([2, 1, 9]));
        assert_eq!(f.pixel(3, 1), None);
        assert_eq!(f.into_raw().len(), 18);
    }

    #[test]
    fn test_box_around_landmarks() {
        let lm: LandmarkSet = [(10.0, 20.0), (30.0, 20.0), (20.0, 30.0), (12.0, 40.0), (28.0, 40.0)];
        let b = BoundingBox::around_landmarks(&lm, 0.5);
        assert_eq!((b.x, b.y), (0.0, 10.0));
        assert_eq!((b.width, b.height), (40.0, 40.0));
        assert_eq!(b.landmarks, Some(lm));
    }

    #[test]
    fn test_unknown_result() {
        let r = MatchResult::unknown(0.31);
        assert!(!r.is_match());
        assert_eq!(r.id_or_sentinel(), -1);
        assert_eq!(r.name, UNKNOWN_NAME);
        assert_eq!(r.overlay_text(), "unknown 0.31");
    }
}
