use crate::weights::Weights;

/// Trains a model locally between two synchronizations with the session.
pub trait LocalTrainer {
    /// Trains starting from `weights`.
    ///
    /// # Arguments
    /// * `weights` - The weights to start from.
    /// * `round` - The aggregation round being trained for.
    ///
    /// # Returns
    /// The locally trained weights.
    fn train(&mut self, weights: Weights, round: u64) -> Weights;
}

impl<F> LocalTrainer for F
where
    F: FnMut(Weights, u64) -> Weights,
{
    fn train(&mut self, weights: Weights, round: u64) -> Weights {
        self(weights, round)
    }
}

/// Moves every weight a fraction of the way towards a fixed target.
///
/// Stands in for a real model, every participant drifting to it's own target makes the effect
/// of the global average easy to follow.
#[derive(Debug, Clone, Copy)]
pub struct DriftTrainer {
    target: f32,
    rate: f32,
}

impl DriftTrainer {
    /// Creates a new `DriftTrainer`.
    ///
    /// # Arguments
    /// * `target` - The value every weight drifts towards.
    /// * `rate` - The fraction of the distance covered each round, within [0, 1].
    pub fn new(target: f32, rate: f32) -> Self {
        Self {
            target,
            rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl LocalTrainer for DriftTrainer {
    fn train(&mut self, mut weights: Weights, _round: u64) -> Weights {
        weights
            .iter_mut()
            .for_each(|w| *w += self.rate * (self.target - *w));
        weights
    }
}
