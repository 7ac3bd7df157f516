use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{DEFAULT_CHIP, Direction};
use crate::error::{GpioError, IoFault};
use crate::line::{GpioBackend, RawLine};
use crate::registry::PinDescriptor;

const MOCK_DEFAULT_NUM_LINES: u32 = 54;

/// In-memory board used by tests and by builds without `hardware-gpio`.
///
/// Chips are identified by path and expose a fixed number of lines. Claims
/// are exclusive, input levels can be driven from the outside with
/// [`MockGpioBackend::set_level`], and transport faults can be injected per
/// line.
#[derive(Clone)]
pub struct MockGpioBackend {
    board: Arc<Mutex<MockBoard>>,
}

#[derive(Default)]
struct MockBoard {
    chips: FxHashMap<String, u32>,
    lines: FxHashMap<(String, u32), MockLineState>,
}

#[derive(Default)]
struct MockLineState {
    level: bool,
    claimed: bool,
    fault: Option<IoFault>,
}

impl MockBoard {
    fn line_mut(&mut self, chip: &str, line: u32) -> &mut MockLineState {
        self.lines.entry((chip.to_string(), line)).or_default()
    }
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::with_chip(DEFAULT_CHIP, MOCK_DEFAULT_NUM_LINES)
    }
}

impl MockGpioBackend {
    pub fn with_chip(path: &str, num_lines: u32) -> Self {
        let backend = Self {
            board: Arc::new(Mutex::new(MockBoard::default())),
        };
        backend.add_chip(path, num_lines);
        backend
    }

    pub fn add_chip(&self, path: &str, num_lines: u32) {
        self.board.lock().chips.insert(path.to_string(), num_lines);
    }

    /// Drives the physical level of a line, as an external signal would.
    pub fn set_level(&self, chip: &str, line: u32, level: bool) {
        self.board.lock().line_mut(chip, line).level = level;
    }

    pub fn physical_level(&self, chip: &str, line: u32) -> Option<bool> {
        self.board
            .lock()
            .lines
            .get(&(chip.to_string(), line))
            .map(|l| l.level)
    }

    pub fn is_claimed(&self, chip: &str, line: u32) -> bool {
        self.board
            .lock()
            .lines
            .get(&(chip.to_string(), line))
            .is_some_and(|l| l.claimed)
    }

    /// Marks a line as held by some other consumer.
    pub fn claim_externally(&self, chip: &str, line: u32) {
        self.board.lock().line_mut(chip, line).claimed = true;
    }

    pub fn inject_fault(&self, chip: &str, line: u32, fault: Option<IoFault>) {
        self.board.lock().line_mut(chip, line).fault = fault;
    }
}

impl GpioBackend for MockGpioBackend {
    type Line = MockLine;

    fn request_line(&self, descriptor: &PinDescriptor) -> Result<MockLine, GpioError> {
        let mut board = self.board.lock();

        let absent = board
            .chips
            .get(&descriptor.chip)
            .is_none_or(|num_lines| descriptor.line >= *num_lines);
        if absent {
            return Err(GpioError::HardwareAbsent {
                chip: descriptor.chip.clone(),
                line: descriptor.line,
            });
        }

        let state = board.line_mut(&descriptor.chip, descriptor.line);
        if state.claimed {
            return Err(GpioError::HardwareBusy {
                chip: descriptor.chip.clone(),
                line: descriptor.line,
            });
        }
        state.claimed = true;
        if descriptor.direction == Direction::Output {
            state.level = descriptor.idle_physical_level();
        }

        Ok(MockLine {
            board: self.board.clone(),
            pin: descriptor.id,
            key: (descriptor.chip.clone(), descriptor.line),
            released: false,
        })
    }
}

pub struct MockLine {
    board: Arc<Mutex<MockBoard>>,
    pin: u32,
    key: (String, u32),
    released: bool,
}

impl MockLine {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockLineState) -> T,
    ) -> Result<T, GpioError> {
        let mut board = self.board.lock();
        let state = board
            .lines
            .get_mut(&self.key)
            .ok_or_else(|| GpioError::io(self.pin, "line vanished from chip"))?;
        if let Some(fault) = state.fault {
            return Err(GpioError::HardwareIo {
                pin: self.pin,
                fault,
                reason: format!("injected fault on line {}", self.key.1),
            });
        }
        Ok(f(state))
    }
}

impl RawLine for MockLine {
    fn read_level(&mut self) -> Result<bool, GpioError> {
        self.with_state(|state| state.level)
    }

    fn write_level(&mut self, level: bool) -> Result<(), GpioError> {
        self.with_state(|state| state.level = level)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(state) = self.board.lock().lines.get_mut(&self.key) {
            state.claimed = false;
        }
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        self.release();
    }
}
