use std::sync::Arc;

use log::debug;

use crate::config::Direction;
use crate::error::GpioError;
use crate::registry::PinDescriptor;

/// A claimed physical line. Levels here are physical, polarity is applied by
/// [`LineHandle`].
pub trait RawLine: Send {
    fn read_level(&mut self) -> Result<bool, GpioError>;
    fn write_level(&mut self, level: bool) -> Result<(), GpioError>;
    /// Gives the claim back to the kernel. Must tolerate repeated calls.
    fn release(&mut self);
}

pub trait GpioBackend: Send + Sync {
    type Line: RawLine + 'static;

    /// Claims the line described by `descriptor` in its configured
    /// direction. Outputs start at [`PinDescriptor::idle_physical_level`].
    fn request_line(&self, descriptor: &PinDescriptor) -> Result<Self::Line, GpioError>;
}

/// Owning guard over one claimed line.
pub struct LineHandle<L: RawLine> {
    descriptor: Arc<PinDescriptor>,
    raw: Option<L>,
}

impl<L: RawLine> LineHandle<L> {
    pub fn open<B>(backend: &B, descriptor: Arc<PinDescriptor>) -> Result<Self, GpioError>
    where
        B: GpioBackend<Line = L> + ?Sized,
    {
        let raw = backend.request_line(&descriptor)?;
        debug!(
            "claimed line {} on {} for pin {} ({})",
            descriptor.line, descriptor.chip, descriptor.id, descriptor.direction
        );
        Ok(Self {
            descriptor,
            raw: Some(raw),
        })
    }

    pub fn descriptor(&self) -> &Arc<PinDescriptor> {
        &self.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_some()
    }

    pub fn read(&mut self) -> Result<bool, GpioError> {
        let pin = self.descriptor.id;
        let raw = self
            .raw
            .as_mut()
            .ok_or_else(|| GpioError::io(pin, "line already released"))?;
        let level = raw.read_level()?;
        Ok(self.descriptor.polarity.apply(level))
    }

    pub fn write(&mut self, value: bool) -> Result<(), GpioError> {
        if self.descriptor.direction != Direction::Output {
            return Err(GpioError::InvalidDirection {
                pin: self.descriptor.id,
                direction: self.descriptor.direction,
            });
        }
        let pin = self.descriptor.id;
        let raw = self
            .raw
            .as_mut()
            .ok_or_else(|| GpioError::io(pin, "line already released"))?;
        raw.write_level(self.descriptor.polarity.apply(value))
    }

    pub fn close(&mut self) {
        if let Some(mut raw) = self.raw.take() {
            raw.release();
            debug!(
                "released line {} on {} for pin {}",
                self.descriptor.line, self.descriptor.chip, self.descriptor.id
            );
        }
    }
}

impl<L: RawLine> Drop for LineHandle<L> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::config::Polarity;
    use crate::error::IoFault;

    fn descriptor(id: u32, direction: Direction, polarity: Polarity) -> Arc<PinDescriptor> {
        Arc::new(PinDescriptor {
            id,
            name: format!("gpio{id}"),
            chip: "/dev/gpiochip0".into(),
            line: id,
            direction,
            polarity,
            debounce: Duration::ZERO,
            initial: None,
        })
    }

    #[test]
    fn write_then_read_returns_written_value() {
        let backend = MockGpioBackend::default();
        let mut handle =
            LineHandle::open(&backend, descriptor(27, Direction::Output, Polarity::ActiveLow))
                .expect("open");

        handle.write(true).expect("write");
        assert!(handle.read().expect("read"));
        assert!(!backend.physical_level("/dev/gpiochip0", 27).unwrap());

        handle.write(false).expect("write");
        assert!(!handle.read().expect("read"));
    }

    #[test]
    fn writing_an_input_is_rejected() {
        let backend = MockGpioBackend::default();
        let mut handle =
            LineHandle::open(&backend, descriptor(17, Direction::Input, Polarity::ActiveHigh))
                .expect("open");
        assert!(matches!(
            handle.write(true),
            Err(GpioError::InvalidDirection { pin: 17, .. })
        ));
    }

    #[test]
    fn concurrent_open_yields_one_busy() {
        let backend = Arc::new(MockGpioBackend::default());
        let barrier = Arc::new(Barrier::new(2));
        let desc = descriptor(5, Direction::Input, Polarity::ActiveHigh);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let backend = backend.clone();
                let barrier = barrier.clone();
                let desc = desc.clone();
                thread::spawn(move || {
                    barrier.wait();
                    LineHandle::open(backend.as_ref(), desc)
                })
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(GpioError::HardwareBusy { line: 5, .. })))
                .count(),
            1
        );
    }

    #[test]
    fn close_is_idempotent_and_frees_the_line() {
        let backend = MockGpioBackend::default();
        let desc = descriptor(6, Direction::Output, Polarity::ActiveHigh);
        let mut handle = LineHandle::open(&backend, desc.clone()).expect("open");
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(handle.read().is_err());

        let _again = LineHandle::open(&backend, desc).expect("reopen after close");
    }

    #[test]
    fn drop_releases_the_claim() {
        let backend = MockGpioBackend::default();
        let desc = descriptor(7, Direction::Input, Polarity::ActiveHigh);
        drop(LineHandle::open(&backend, desc.clone()).expect("open"));
        assert!(!backend.is_claimed("/dev/gpiochip0", 7));
    }

    #[test]
    fn missing_line_is_absent() {
        let backend = MockGpioBackend::with_chip("/dev/gpiochip0", 8);
        let result = LineHandle::open(&backend, descriptor(9, Direction::Input, Polarity::ActiveHigh));
        assert!(matches!(result, Err(GpioError::HardwareAbsent { line: 9, .. })));
    }

    #[test]
    fn transport_faults_surface_as_io_errors() {
        let backend = MockGpioBackend::default();
        let mut handle =
            LineHandle::open(&backend, descriptor(4, Direction::Input, Polarity::ActiveHigh))
                .expect("open");
        backend.inject_fault("/dev/gpiochip0", 4, Some(IoFault::Timeout));
        let err = handle.read().unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_recoverable());

        backend.inject_fault("/dev/gpiochip0", 4, None);
        assert!(handle.read().is_ok());
    }
}
