pub mod backend;
pub mod config;
pub mod debounce;
mod dispatch;
pub mod error;
pub mod gpio;
pub mod line;
pub mod registry;

pub use config::{AppConfig, Direction, PinConfig, Polarity};
pub use debounce::{EdgeFilter, Transition};
pub use error::{CallbackError, GpioError, IoFault};
pub use gpio::{
    EdgeCallback, EdgeEvent, GpioManager, ManagerOptions, ManagerState, PinStatus, Subscription,
};
pub use line::{GpioBackend, LineHandle, RawLine};
pub use registry::{PinDescriptor, PinRegistry};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
