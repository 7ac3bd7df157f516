use std::fmt;
use std::io;

use thiserror::Error;

use crate::config::Direction;

/// Classification of a transport fault reported by a hardware binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFault {
    Transport,
    Timeout,
}

impl fmt::Display for IoFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoFault::Transport => f.write_str("transport fault"),
            IoFault::Timeout => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Line {line} on {chip} is already claimed")]
    HardwareBusy { chip: String, line: u32 },
    #[error("Line {line} on {chip} does not exist")]
    HardwareAbsent { chip: String, line: u32 },
    #[error("GPIO I/O error on pin {pin} ({fault}): {reason}")]
    HardwareIo {
        pin: u32,
        fault: IoFault,
        reason: String,
    },
    #[error("Pin {pin} is configured as {direction}")]
    InvalidDirection { pin: u32, direction: Direction },
    #[error("Pin not found: {0}")]
    UnknownPin(u32),
    #[error("Line manager has not been started")]
    NotStarted,
    #[error("Line manager is closed")]
    ManagerClosed,
    #[error("Failed to spawn dispatch thread: {0}")]
    Spawn(#[source] io::Error),
}

impl GpioError {
    pub(crate) fn io(pin: u32, reason: impl Into<String>) -> Self {
        GpioError::HardwareIo {
            pin,
            fault: IoFault::Transport,
            reason: reason.into(),
        }
    }

    /// Maps a failed line request. The kernel answers `EBUSY` when another
    /// consumer holds the line, which is a claim conflict rather than a fault.
    pub(crate) fn claim_failed(
        chip: &str,
        line: u32,
        pin: u32,
        errno: Option<i32>,
        reason: impl Into<String>,
    ) -> Self {
        let busy = errno.is_some_and(|code| {
            io::Error::from_raw_os_error(code).kind() == io::ErrorKind::ResourceBusy
        });
        if busy {
            GpioError::HardwareBusy {
                chip: chip.to_string(),
                line,
            }
        } else {
            GpioError::io(pin, reason)
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GpioError::HardwareIo {
                fault: IoFault::Timeout,
                ..
            }
        )
    }

    /// Hardware faults may succeed on a later call; everything else is a
    /// configuration or caller mistake.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GpioError::HardwareBusy { .. }
                | GpioError::HardwareAbsent { .. }
                | GpioError::HardwareIo { .. }
        )
    }
}

/// Error type returned by subscriber callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
