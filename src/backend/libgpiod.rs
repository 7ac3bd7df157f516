use log::warn;
use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};

use crate::config::Direction;
use crate::error::GpioError;
use crate::line::{GpioBackend, RawLine};
use crate::registry::PinDescriptor;

/// Linux GPIO character device backend.
pub struct LibgpiodBackend {
    consumer: String,
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, GpioError> {
        Ok(Self {
            consumer: env!("CARGO_PKG_NAME").to_string(),
        })
    }

    fn open_chip(descriptor: &PinDescriptor) -> Result<Chip, GpioError> {
        let p = PathBuf::from(&descriptor.chip);
        Chip::open(&p).map_err(|e| {
            warn!("open chip {}: {e}", descriptor.chip);
            GpioError::HardwareAbsent {
                chip: descriptor.chip.clone(),
                line: descriptor.line,
            }
        })
    }

    fn check_line(chip: &Chip, descriptor: &PinDescriptor) -> Result<(), GpioError> {
        let pin = descriptor.id;
        let num_lines = chip
            .info()
            .map_err(|e| GpioError::io(pin, format!("chip info: {e}")))?
            .num_lines();
        if descriptor.line as usize >= num_lines {
            return Err(GpioError::HardwareAbsent {
                chip: descriptor.chip.clone(),
                line: descriptor.line,
            });
        }

        let info = chip
            .line_info(descriptor.line)
            .map_err(|e| GpioError::io(pin, format!("line info: {e}")))?;
        if info.is_used() {
            return Err(GpioError::HardwareBusy {
                chip: descriptor.chip.clone(),
                line: descriptor.line,
            });
        }
        Ok(())
    }

    fn make_line_settings(descriptor: &PinDescriptor) -> Result<line::Settings, GpioError> {
        let pin = descriptor.id;
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::io(pin, format!("libgpiod settings: {e}")))?;

        match descriptor.direction {
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| GpioError::io(pin, format!("set direction: {e}")))?;
            }
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| GpioError::io(pin, format!("set direction: {e}")))?;
                ls.set_output_value(to_value(descriptor.idle_physical_level()))
                    .map_err(|e| GpioError::io(pin, format!("set output value: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(
        descriptor: &PinDescriptor,
        settings: line::Settings,
    ) -> Result<line::Config, GpioError> {
        let pin = descriptor.id;
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::io(pin, format!("line config: {e}")))?;
        cfg.add_line_settings(&[descriptor.line], settings)
            .map_err(|e| GpioError::io(pin, format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn request_lines(
        &self,
        chip: &Chip,
        descriptor: &PinDescriptor,
        line_cfg: &line::Config,
    ) -> Result<request::Request, GpioError> {
        let pin = descriptor.id;
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::io(pin, format!("request config: {e}")))?;
        req_cfg
            .set_consumer(&self.consumer)
            .map_err(|e| GpioError::io(pin, format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg).map_err(|e| {
            let errno = match &e {
                libgpiod::Error::OperationFailed(_, errno) => Some(errno.0),
                _ => None,
            };
            GpioError::claim_failed(
                &descriptor.chip,
                descriptor.line,
                pin,
                errno,
                format!("request lines: {e}"),
            )
        })
    }
}

impl GpioBackend for LibgpiodBackend {
    type Line = LibgpiodLine;

    fn request_line(&self, descriptor: &PinDescriptor) -> Result<LibgpiodLine, GpioError> {
        let chip = Self::open_chip(descriptor)?;
        Self::check_line(&chip, descriptor)?;

        let line_settings = Self::make_line_settings(descriptor)?;
        let line_cfg = Self::make_line_config(descriptor, line_settings)?;
        let request = self.request_lines(&chip, descriptor, &line_cfg)?;

        Ok(LibgpiodLine {
            pin: descriptor.id,
            offset: descriptor.line,
            request: Some(request),
        })
    }
}

pub struct LibgpiodLine {
    pin: u32,
    offset: u32,
    request: Option<request::Request>, // dropping the request frees the line
}

impl LibgpiodLine {
    fn request(&mut self) -> Result<&mut request::Request, GpioError> {
        let pin = self.pin;
        self.request
            .as_mut()
            .ok_or_else(|| GpioError::io(pin, "line already released"))
    }
}

impl RawLine for LibgpiodLine {
    fn read_level(&mut self) -> Result<bool, GpioError> {
        let (pin, offset) = (self.pin, self.offset);
        let value = self
            .request()?
            .value(offset)
            .map_err(|e| GpioError::io(pin, format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => false,
            line::Value::Active => true,
        })
    }

    fn write_level(&mut self, level: bool) -> Result<(), GpioError> {
        let (pin, offset) = (self.pin, self.offset);
        self.request()?
            .set_value(offset, to_value(level))
            .map_err(|e| GpioError::io(pin, format!("set value: {e}")))?;
        Ok(())
    }

    fn release(&mut self) {
        drop(self.request.take());
    }
}

fn to_value(level: bool) -> line::Value {
    if level {
        line::Value::Active
    } else {
        line::Value::InActive
    }
}
