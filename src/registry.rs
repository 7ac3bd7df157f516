use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::{AppConfig, Direction, Polarity};
use crate::error::GpioError;

/// Static description of one configured pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinDescriptor {
    pub id: u32,
    pub name: String,
    pub chip: String,
    pub line: u32,
    pub direction: Direction,
    pub polarity: Polarity,
    pub debounce: Duration,
    pub initial: Option<bool>,
}

impl PinDescriptor {
    /// Physical level an output line is requested at.
    pub fn idle_physical_level(&self) -> bool {
        self.polarity.apply(self.initial.unwrap_or(false))
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }
}

/// Immutable catalogue of configured pins, keyed by pin id.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: FxHashMap<u32, Arc<PinDescriptor>>,
}

impl PinRegistry {
    pub fn load(config: &AppConfig) -> Result<Self, GpioError> {
        let mut pins = FxHashMap::default();
        let mut lines = HashSet::new();

        for pin in &config.pins {
            let chip = pin.chip.clone().unwrap_or_else(|| config.chip.clone());
            let line = pin.line.unwrap_or(pin.id);

            match pin.direction {
                Direction::Input if pin.initial.is_some() => {
                    return Err(GpioError::Config(format!(
                        "pin {}: initial level is only valid for outputs",
                        pin.id
                    )));
                }
                Direction::Output if pin.debounce_ms != 0 => {
                    return Err(GpioError::Config(format!(
                        "pin {}: debounce is only valid for inputs",
                        pin.id
                    )));
                }
                _ => {}
            }

            if !lines.insert((chip.clone(), line)) {
                return Err(GpioError::Config(format!(
                    "pin {}: line {line} on {chip} is already assigned",
                    pin.id
                )));
            }

            let descriptor = PinDescriptor {
                id: pin.id,
                name: pin.name.clone().unwrap_or_else(|| format!("gpio{}", pin.id)),
                chip,
                line,
                direction: pin.direction,
                polarity: pin.polarity,
                debounce: Duration::from_millis(pin.debounce_ms),
                initial: pin.initial,
            };

            if pins.insert(pin.id, Arc::new(descriptor)).is_some() {
                return Err(GpioError::Config(format!("duplicate pin id {}", pin.id)));
            }
        }

        Ok(Self { pins })
    }

    pub fn get(&self, pin_id: u32) -> Result<&Arc<PinDescriptor>, GpioError> {
        self.pins
            .get(&pin_id)
            .ok_or(GpioError::UnknownPin(pin_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PinDescriptor>> {
        self.pins.values()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
