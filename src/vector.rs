//! Vector helpers: validation, L2 normalization and cosine similarity.
//!
//! Every vector that reaches storage or a similarity comparison goes through
//! [`checked_unit`], regardless of what the embedder promised.

use crate::error::EncodingError;

/// Tolerance used when asserting a vector is unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

/// Euclidean norm, accumulated in f64.
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt() as f32
}

/// Returns a unit-length copy of `vector`.
pub fn normalize(vector: &[f32]) -> Result<Vec<f32>, EncodingError> {
    if let Some(index) = vector.iter().position(|x| !x.is_finite()) {
        return Err(EncodingError::NonFinite { index });
    }
    let norm = vector
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EncodingError::ZeroNorm);
    }
    Ok(vector
        .iter()
        .map(|x| (f64::from(*x) / norm) as f32)
        .collect())
}

/// Validates the dimension then normalizes.
pub fn checked_unit(vector: &[f32], expected_dim: usize) -> Result<Vec<f32>, EncodingError> {
    if vector.len() != expected_dim {
        return Err(EncodingError::DimensionMismatch {
            expected: expected_dim,
            actual: vector.len(),
        });
    }
    normalize(vector)
}

/// Whether `vector` is unit length within [`UNIT_NORM_TOLERANCE`].
pub fn is_unit(vector: &[f32]) -> bool {
    (l2_norm(vector) - 1.0).abs() < UNIT_NORM_TOLERANCE
}

/// Dot product; equals cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum::<f64>() as f32
}

/// `w_a * a + w_b * b`, component-wise. Both slices must share a length.
pub fn weighted_sum(a: &[f32], w_a: f32, b: &[f32], w_b: f32) -> Vec<f32> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| w_a * x + w_b * y)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vector() {
        let unit = normalize(&[3.0, 4.0]).unwrap();
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);
        assert!(is_unit(&unit));
    }

    #[test]
    fn normalize_rejects_zero_and_nan() {
        assert!(matches!(normalize(&[0.0, 0.0]), Err(EncodingError::ZeroNorm)));
        assert!(matches!(
            normalize(&[1.0, f32::NAN]),
            Err(EncodingError::NonFinite { index: 1 })
        ));
    }

    #[test]
    fn checked_unit_enforces_dimension() {
        match checked_unit(&[1.0, 0.0, 0.0], 2) {
            Err(EncodingError::DimensionMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (2, 3));
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn dot_of_unit_vectors_is_cosine() {
        let a = normalize(&[1.0, 1.0]).unwrap();
        let b = normalize(&[1.0, 0.0]).unwrap();
        assert!((dot(&a, &b) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-6);
    }
}
