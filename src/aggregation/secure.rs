use std::collections::BTreeMap;

use comms::NodeId;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Roster, Strategy};
use crate::weights::Weights;

/// Additive secret sharing aggregation over two communication rounds.
///
/// In the first communication round every node splits it's weights into one random share per
/// roster node, so that no single share reveals anything, and the received shares are summed
/// into a partial sum. In the second one the partial sums are exchanged and averaged, which
/// equals the average of every node's weights.
///
/// The shares are only consistent if the roster is the same on every node when they are made,
/// the roster must be agreed upon before `make_payloads` is called.
#[derive(Debug, Clone)]
pub struct SecureStrategy {
    max_share_value: f32,
    rng: StdRng,
}

impl SecureStrategy {
    /// Creates a new `SecureStrategy`.
    ///
    /// # Arguments
    /// * `max_share_value` - The magnitude of the noise of each random share.
    pub fn new(max_share_value: f32) -> Self {
        Self {
            max_share_value,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Creates a new `SecureStrategy` with a seeded share generator.
    pub fn with_seed(max_share_value: f32, seed: u64) -> Self {
        Self {
            max_share_value,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Splits `secret` into `n` additive shares.
    ///
    /// # Returns
    /// `n` buffers that add up to `secret`, or nothing if `n` is zero.
    pub fn generate_shares(&mut self, secret: &Weights, n: usize) -> Vec<Weights> {
        if n == 0 {
            return Vec::new();
        }

        let mut shares: Vec<Weights> = (0..n - 1)
            .map(|_| self.random_share(secret.len()))
            .collect();
        shares.push(Self::last_share(&shares, secret));
        shares
    }

    /// The share completing `shares` so that everything adds up to `secret`.
    fn last_share(shares: &[Weights], secret: &Weights) -> Weights {
        let mut last = secret.clone();
        shares.iter().for_each(|share| last.sub_assign(share));
        last
    }

    fn random_share(&mut self, len: usize) -> Weights {
        let max = self.max_share_value;
        let rng = &mut self.rng;

        if max <= 0.0 {
            return Weights::filled(0.0, len);
        }

        (0..len)
            .map(|_| rng.random_range(-max..=max))
            .collect::<Vec<_>>()
            .into()
    }
}

impl Strategy<Weights> for SecureStrategy {
    fn combine(&self, communication_round: usize, contributions: &[&Weights]) -> Weights {
        let all = contributions.iter().copied();

        let combined = match communication_round {
            0 => Weights::sum(all),
            _ => Weights::mean(all),
        };

        combined.unwrap_or_default()
    }

    fn communication_rounds(&self) -> usize {
        2
    }

    /// Shares of `base` in the first communication round, `base` itself to everyone afterwards.
    fn make_payloads(
        &mut self,
        communication_round: usize,
        base: &Weights,
        roster: &Roster,
    ) -> BTreeMap<NodeId, Weights> {
        if communication_round > 0 {
            return roster
                .iter()
                .map(|node| (node.clone(), base.clone()))
                .collect();
        }

        let shares = self.generate_shares(base, roster.len());
        roster.iter().cloned().zip(shares).collect()
    }
}
