//! pf-core: Shared foundation for PinForge ball tracking
//!
//! Error type, millisecond clock and timer queue, the hardware capability
//! traits the tracking core is written against, the ball event catalogue,
//! and an in-memory platform for tests and simulation.

mod error;
mod events;
mod hardware;
mod time;
pub mod virtual_platform;

pub use error::*;
pub use events::*;
pub use hardware::*;
pub use time::*;
