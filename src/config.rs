use std::{fmt, fs, path::Path};

use serde::Deserialize;

use crate::error::GpioError;

pub const DEFAULT_CHIP: &str = "/dev/gpiochip0";

#[derive(Debug, Hash, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Maps between logical and physical levels. The mapping is its own
    /// inverse, so it serves both directions.
    pub fn apply(self, level: bool) -> bool {
        match self {
            Polarity::ActiveHigh => level,
            Polarity::ActiveLow => !level,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PinConfig {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub chip: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub direction: Direction,
    #[serde(default)]
    pub polarity: Polarity,
    #[serde(default)]
    pub debounce_ms: u64,
    #[serde(default)]
    pub initial: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    pub pins: Vec<PinConfig>,
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_string()
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        if config.poll_interval_ms == 0 {
            return Err(GpioError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if config.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "broadcast_capacity must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}
