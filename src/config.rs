//! Serde described configuration for both ends of a federated session.

use std::{error::Error, fmt, fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    aggregation::{Aggregator, Strategy, Threshold, ThresholdErr},
    session::SessionController,
    weights::Weights,
};

const DEFAULT_RESULT_TIMEOUT_SECS: u64 = 30;

/// Configuration failures.
#[derive(Debug)]
pub enum ConfigErr {
    Io(io::Error),
    Json(serde_json::Error),
    Threshold(ThresholdErr),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErr::Io(e) => write!(f, "io error: {e}"),
            ConfigErr::Json(e) => write!(f, "malformed configuration: {e}"),
            ConfigErr::Threshold(e) => write!(f, "invalid threshold: {e}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigErr::Io(e) => Some(e),
            ConfigErr::Json(e) => Some(e),
            ConfigErr::Threshold(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConfigErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ThresholdErr> for ConfigErr {
    fn from(value: ThresholdErr) -> Self {
        Self::Threshold(value)
    }
}

/// How the round `Threshold` is configured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSpec {
    Absolute { count: usize },
    Relative { fraction: f64 },
}

/// Which `Strategy` combines contributions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySpec {
    #[default]
    Mean,
    Sum,
}

/// The weights a session starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsSpec {
    Const { value: f32, len: usize },
    Values { data: Vec<f32> },
}

/// Server side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub min_participants: usize,
    pub threshold: ThresholdSpec,
    pub round_cutoff: u64,
    #[serde(default)]
    pub strategy: StrategySpec,
    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,
    pub initial_weights: WeightsSpec,
}

/// Client side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,
    #[serde(default = "default_rounds")]
    pub rounds: usize,
}

fn default_result_timeout_secs() -> u64 {
    DEFAULT_RESULT_TIMEOUT_SECS
}

fn default_rounds() -> usize {
    10
}

/// Reads and parses a json configuration file.
fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigErr> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_participants: 2,
            threshold: ThresholdSpec::Relative { fraction: 1.0 },
            round_cutoff: 0,
            strategy: StrategySpec::Mean,
            result_timeout_secs: DEFAULT_RESULT_TIMEOUT_SECS,
            initial_weights: WeightsSpec::Const { value: 0.0, len: 8 },
        }
    }
}

impl ServerConfig {
    /// Loads a `ServerConfig` from the json file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigErr> {
        load(path)
    }

    /// Resolves the configured threshold.
    ///
    /// # Returns
    /// The threshold or an error if it's values are meaningless.
    pub fn threshold(&self) -> Result<Threshold, ConfigErr> {
        let threshold = match self.threshold {
            ThresholdSpec::Absolute { count } => Threshold::absolute(count)?,
            ThresholdSpec::Relative { fraction } => Threshold::relative(fraction)?,
        };

        Ok(threshold)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    /// Generates the weights the session starts from.
    pub fn initial_weights(&self) -> Weights {
        match &self.initial_weights {
            WeightsSpec::Const { value, len } => Weights::filled(*value, *len),
            WeightsSpec::Values { data } => Weights::from(data.clone()),
        }
    }

    /// Builds a `SessionController` out of this configuration.
    ///
    /// The strategy is given by the caller since it's concrete type is chosen by matching on
    /// `self.strategy`.
    ///
    /// # Arguments
    /// * `strategy` - How contributions are combined.
    ///
    /// # Returns
    /// A new session controller or an error if the configuration is invalid.
    pub fn controller<S>(&self, strategy: S) -> Result<SessionController<S>, ConfigErr>
    where
        S: Strategy<Weights> + Send + 'static,
    {
        let aggregator = Aggregator::new(strategy, self.threshold()?, self.round_cutoff);
        let controller =
            SessionController::new(aggregator, self.initial_weights(), self.min_participants)
                .with_result_timeout(self.result_timeout());

        Ok(controller)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            result_timeout_secs: DEFAULT_RESULT_TIMEOUT_SECS,
            rounds: default_rounds(),
        }
    }
}

impl ClientConfig {
    /// Loads a `ClientConfig` from the json file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigErr> {
        load(path)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }
}
