//! Embedding normalization and cosine similarity.

/// Vectors with an L2 norm below this are treated as zero.
pub const NORM_EPSILON: f32 = 1e-6;

/// L2 norm of a feature vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize `v` in place.
///
/// A near-zero or non-finite vector becomes all zeros so that every cosine
/// score against it is 0 rather than NaN.
pub fn normalize_in_place(v: &mut [f32]) {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < NORM_EPSILON {
        v.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    v.iter_mut().for_each(|x| *x /= norm);
}

/// Return an L2-normalized copy of `v`.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}

/// Cosine similarity of two already-normalized vectors: their dot product,
/// clamped to [-1, 1] against rounding.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<f32> {
        (0..512).map(|i| ((i * 37 % 101) as f32 - 50.0) / 7.0).collect()
    }

    #[test]
    fn test_normalize_unit_norm() {
        let n = normalize(&sample());
        assert!((l2_norm(&n) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize(&sample());
        let twice = normalize(&once);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalize_zero_vector() {
        let n = normalize(&[0.0; 8]);
        assert!(n.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_normalize_tiny_vector_becomes_zero() {
        let n = normalize(&[1e-9, -1e-9, 0.0]);
        assert!(n.iter().all(|&x| x == 0.0));
        assert!(n.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_normalize_non_finite_becomes_zero() {
        for v in [[f32::NAN, 1.0, 0.0], [f32::INFINITY, 1.0, 0.0], [f32::NEG_INFINITY, 0.0, 0.0]] {
            let n = normalize(&v);
            assert_eq!(n, vec![0.0; 3], "input {v:?}");
        }
    }

    #[test]
    fn test_cosine_identical_and_opposite() {
        let v = normalize(&sample());
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
        assert!((cosine(&v, &neg) + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let v = normalize(&sample());
        let zero = normalize(&vec![0.0; v.len()]);
        assert_eq!(cosine(&v, &zero), 0.0);
    }
}
