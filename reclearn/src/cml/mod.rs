//! Collaborative metric learning.
//!
//! Users and items live in one euclidean embedding, a user is recommended the
//! items closest to them. Training minimizes a WARP style hinge loss which
//! pulls the positive item of each interaction closer to the user than the
//! closest sampled negative item by at least a margin. Optionally, item
//! features are mapped into the embedding by a small feed forward network and
//! item embeddings are pulled towards their projection.

mod data;
mod model;
mod optimizer;
mod projector;
mod trainer;

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    data::{BatchLoss, GradientSet},
    model::{Cml, CreatingCmlFailed, LoadingCmlFailed},
    optimizer::{Adagrad, MiniBatchSgd, Optimizer},
    projector::{FeatureProjector, ProjectorGradientSet},
    trainer::{
        CmlTrainer,
        RoundOutcome,
        TrainingController,
        TrainingError,
        DEFAULT_BATCHES_PER_ROUND,
    },
};

/// Invalid CML hyper-parameter.
#[derive(Debug, Display, Error, PartialEq)]
pub enum InvalidConfig {
    /// {name} must be larger than 0
    ZeroDimension { name: &'static str },
    /// {name} must be a positive finite number, got {value}
    NotPositive { name: &'static str, value: f32 },
    /// {name} must be a non-negative finite number, got {value}
    Negative { name: &'static str, value: f32 },
    /// dropout rate must be in [0, 1), got {0}
    DropoutRate(f32),
}

/// Hyper-parameters of a [`Cml`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmlConfig {
    /// Dimension of the user and item embeddings.
    pub embed_dim: usize,
    /// Hinge loss threshold.
    pub margin: f32,
    /// Learning rate of the optimizers.
    pub master_learning_rate: f32,
    /// Upper bound of the norm of each embedding and feature projection.
    pub clip_norm: f32,
    /// Units in the hidden layer of the feature projector.
    pub hidden_layer_dim: usize,
    /// Dropout between the hidden and the output layer of the feature projector.
    pub dropout_rate: f32,
    /// Weight of the feature loss.
    pub feature_l2_reg: f32,
    /// Scaling of the feature projector output before clipping.
    pub feature_projection_scaling_factor: f32,
}

impl Default for CmlConfig {
    fn default() -> Self {
        Self {
            embed_dim: 20,
            margin: 0.1,
            master_learning_rate: 0.1,
            clip_norm: 1.0,
            hidden_layer_dim: 128,
            dropout_rate: 0.2,
            feature_l2_reg: 0.1,
            feature_projection_scaling_factor: 0.5,
        }
    }
}

impl CmlConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        fn positive(name: &'static str, value: f32) -> Result<(), InvalidConfig> {
            if value.is_finite() && value > 0. {
                Ok(())
            } else {
                Err(InvalidConfig::NotPositive { name, value })
            }
        }
        fn non_negative(name: &'static str, value: f32) -> Result<(), InvalidConfig> {
            if value.is_finite() && value >= 0. {
                Ok(())
            } else {
                Err(InvalidConfig::Negative { name, value })
            }
        }

        if self.embed_dim == 0 {
            return Err(InvalidConfig::ZeroDimension { name: "embed_dim" });
        }
        if self.hidden_layer_dim == 0 {
            return Err(InvalidConfig::ZeroDimension {
                name: "hidden_layer_dim",
            });
        }
        non_negative("margin", self.margin)?;
        positive("master_learning_rate", self.master_learning_rate)?;
        positive("clip_norm", self.clip_norm)?;
        non_negative("feature_l2_reg", self.feature_l2_reg)?;
        positive(
            "feature_projection_scaling_factor",
            self.feature_projection_scaling_factor,
        )?;
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(InvalidConfig::DropoutRate(self.dropout_rate));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(CmlConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_configs() {
        let config = CmlConfig {
            embed_dim: 0,
            ..CmlConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InvalidConfig::ZeroDimension { name: "embed_dim" })
        );

        let config = CmlConfig {
            clip_norm: 0.,
            ..CmlConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InvalidConfig::NotPositive {
                name: "clip_norm",
                value: 0.
            })
        );

        let config = CmlConfig {
            margin: -0.5,
            ..CmlConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InvalidConfig::Negative {
                name: "margin",
                value: -0.5
            })
        );

        let config = CmlConfig {
            dropout_rate: 1.,
            ..CmlConfig::default()
        };
        assert_eq!(config.validate(), Err(InvalidConfig::DropoutRate(1.)));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: CmlConfig =
            serde_json::from_str(r#"{ "embed_dim": 50, "margin": 1.0, "clip_norm": 1.1 }"#)
                .unwrap();
        assert_eq!(
            config,
            CmlConfig {
                embed_dim: 50,
                margin: 1.0,
                clip_norm: 1.1,
                ..CmlConfig::default()
            }
        );
    }
}
