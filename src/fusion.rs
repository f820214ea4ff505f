//! Image/label fusion into a single retrieval vector.
//!
//! Visually similar radiographs with different diagnoses sit close together
//! in image-only space; pulling each image toward its ground-truth label
//! embedding separates them. This is the only place text and image vectors
//! are combined.

use tracing::debug;

use crate::config::FusionWeights;
use crate::embedder::Embedder;
use crate::error::{ConfigError, EncodingError};
use crate::vector::{checked_unit, normalize, weighted_sum};

/// Produces fused, unit-length vectors for image records.
#[derive(Debug, Clone)]
pub struct FusionEncoder {
    weights: FusionWeights,
    embedding_dim: usize,
    max_tokens: usize,
}

impl FusionEncoder {
    /// Builds an encoder, rejecting invalid weights and a zero dimension.
    pub fn new(
        weights: FusionWeights,
        embedding_dim: usize,
        max_tokens: usize,
    ) -> Result<Self, ConfigError> {
        weights.validate()?;
        if embedding_dim == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        Ok(Self {
            weights,
            embedding_dim,
            max_tokens,
        })
    }

    /// Configured weights.
    pub fn weights(&self) -> FusionWeights {
        self.weights
    }

    /// `normalize(w_img * img + w_label * label)`, or `normalize(img)` when
    /// the label is absent or blank.
    pub fn encode<E: Embedder + ?Sized>(
        &self,
        embedder: &E,
        image: &[u8],
        label: Option<&str>,
    ) -> Result<Vec<f32>, EncodingError> {
        let raw_image = embedder
            .encode_image(image)
            .map_err(|err| encoder_failure("image", err))?;
        let image_vec = checked_unit(&raw_image, self.embedding_dim)?;

        let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
            debug!("no label supplied; using image-only embedding");
            return Ok(image_vec);
        };

        let raw_label = embedder
            .encode_text(label, self.max_tokens)
            .map_err(|err| encoder_failure("text", err))?;
        let label_vec = checked_unit(&raw_label, self.embedding_dim)?;
        self.fuse(&image_vec, &label_vec)
    }

    /// Weighted combination of two unit vectors, renormalized.
    pub fn fuse(&self, image_vec: &[f32], label_vec: &[f32]) -> Result<Vec<f32>, EncodingError> {
        if image_vec.len() != label_vec.len() {
            return Err(EncodingError::DimensionMismatch {
                expected: image_vec.len(),
                actual: label_vec.len(),
            });
        }
        let combined = weighted_sum(
            image_vec,
            self.weights.image,
            label_vec,
            self.weights.label,
        );
        normalize(&combined)
    }
}

pub(crate) fn encoder_failure(input: &'static str, err: anyhow::Error) -> EncodingError {
    EncodingError::Embedder {
        input,
        reason: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{dot, is_unit};

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn encode_text(&self, text: &str, _max_tokens: usize) -> anyhow::Result<Vec<f32>> {
            if text.contains("effusion") {
                Ok(vec![0.0, 2.0, 0.0])
            } else {
                Ok(vec![0.0, 0.0, 5.0])
            }
        }

        fn encode_image(&self, image: &[u8]) -> anyhow::Result<Vec<f32>> {
            anyhow::ensure!(!image.is_empty(), "empty image");
            Ok(vec![3.0, 0.0, 0.0])
        }

        fn model_id(&self) -> &str {
            "axis"
        }
    }

    fn encoder() -> FusionEncoder {
        FusionEncoder::new(FusionWeights::default(), 3, 256).unwrap()
    }

    #[test]
    fn fused_vector_is_unit_and_leans_to_image() {
        let fused = encoder()
            .encode(&AxisEmbedder, b"png", Some("A chest X-ray showing effusion"))
            .unwrap();
        assert!(is_unit(&fused));
        assert!(fused[0] > fused[1]);
        assert!(fused[1] > 0.0);
        assert_eq!(fused[2], 0.0);
    }

    #[test]
    fn blank_label_falls_back_to_image_only() {
        let expected = normalize(&AxisEmbedder.encode_image(b"png").unwrap()).unwrap();
        for label in [None, Some(""), Some("   ")] {
            let fused = encoder().encode(&AxisEmbedder, b"png", label).unwrap();
            assert_eq!(fused, expected);
        }
    }

    #[test]
    fn weights_below_one_still_normalize() {
        let encoder = FusionEncoder::new(FusionWeights { image: 0.2, label: 0.1 }, 3, 256).unwrap();
        let fused = encoder
            .encode(&AxisEmbedder, b"png", Some("effusion"))
            .unwrap();
        let reference = encoder
            .fuse(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0])
            .unwrap();
        assert!(is_unit(&fused));
        assert!((dot(&fused, &reference) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn embedder_failure_is_an_encoding_error() {
        let err = encoder().encode(&AxisEmbedder, b"", Some("effusion")).unwrap_err();
        assert!(matches!(err, EncodingError::Embedder { input: "image", .. }));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let encoder = FusionEncoder::new(FusionWeights::default(), 4, 256).unwrap();
        let err = encoder.encode(&AxisEmbedder, b"png", None).unwrap_err();
        assert!(matches!(
            err,
            EncodingError::DimensionMismatch { expected: 4, actual: 3 }
        ));
    }

    #[test]
    fn invalid_weights_are_rejected_at_construction() {
        for weights in [
            FusionWeights { image: 0.0, label: 0.0 },
            FusionWeights { image: 0.9, label: 0.3 },
            FusionWeights { image: -0.1, label: 0.5 },
            FusionWeights { image: f32::NAN, label: 0.3 },
        ] {
            assert!(matches!(
                FusionEncoder::new(weights, 3, 256),
                Err(ConfigError::FusionWeights { .. })
            ));
        }
        assert!(matches!(
            FusionEncoder::new(FusionWeights::default(), 0, 256),
            Err(ConfigError::ZeroDimension)
        ));
    }
}
