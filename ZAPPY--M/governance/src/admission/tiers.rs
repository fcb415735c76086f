use std::fmt;

use serde::{Deserialize, Serialize};

/// Consecutive qualifying evaluations required before a promotion.
pub const STABILITY_WINDOW: u32 = 5;

/// Autonomy level granted to the training pipeline. `None` is the safe tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustTier {
    /// No trust; the containment target.
    #[default]
    None,
    /// Entry tier granted when training starts.
    A,
    /// Intermediate tier.
    B,
    /// Terminal tier.
    C,
}

impl TrustTier {
    /// Tier above this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::A),
            Self::A => Some(Self::B),
            Self::B => Some(Self::C),
            Self::C => None,
        }
    }

    /// Stable upper-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Externally computed evaluation metrics for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Precision in `[0, 1]`.
    pub precision: f64,
    /// Recall in `[0, 1]`.
    pub recall: f64,
    /// False-positive rate in `[0, 1]`.
    pub false_positive_rate: f64,
    /// KL divergence against the reference distribution.
    pub kl_divergence: f64,
}

/// Metric bounds a batch must meet to count toward a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierThresholds {
    /// Inclusive precision floor.
    pub min_precision: f64,
    /// Inclusive recall floor.
    pub min_recall: f64,
    /// Inclusive false-positive-rate ceiling.
    pub max_false_positive_rate: f64,
    /// Inclusive KL-divergence ceiling.
    pub max_kl_divergence: f64,
}

impl TierThresholds {
    /// Bounds for reaching `tier`. Strictly tighter at every step up.
    #[must_use]
    pub const fn for_tier(tier: TrustTier) -> Self {
        match tier {
            TrustTier::None | TrustTier::A => Self {
                min_precision: 0.80,
                min_recall: 0.75,
                max_false_positive_rate: 0.10,
                max_kl_divergence: 0.20,
            },
            TrustTier::B => Self {
                min_precision: 0.88,
                min_recall: 0.83,
                max_false_positive_rate: 0.06,
                max_kl_divergence: 0.12,
            },
            TrustTier::C => Self {
                min_precision: 0.94,
                min_recall: 0.90,
                max_false_positive_rate: 0.03,
                max_kl_divergence: 0.06,
            },
        }
    }

    /// Bounds an evaluation is judged against while at `current`: the next
    /// tier's, or C's once C is reached.
    #[must_use]
    pub const fn target_for(current: TrustTier) -> Self {
        match current.next() {
            Some(next) => Self::for_tier(next),
            None => Self::for_tier(TrustTier::C),
        }
    }

    /// Whether `metrics` meets every bound. Non-finite values never qualify.
    #[must_use]
    pub fn qualifies(&self, metrics: &EvaluationMetrics) -> bool {
        let finite = [
            metrics.precision,
            metrics.recall,
            metrics.false_positive_rate,
            metrics.kl_divergence,
        ]
        .iter()
        .all(|value| value.is_finite());
        finite
            && metrics.precision >= self.min_precision
            && metrics.recall >= self.min_recall
            && metrics.false_positive_rate <= self.max_false_positive_rate
            && metrics.kl_divergence <= self.max_kl_divergence
    }
}
