//! Data models for sessions, presence, client frames, and bus events.

pub mod bus;
pub mod event;
pub mod presence;
pub mod session;

pub use bus::*;
pub use event::*;
pub use presence::*;
pub use session::*;
