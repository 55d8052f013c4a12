//! Broker core: connection registry, fan-out, presence, bus relay, and session lifecycle.

pub mod broadcast;
pub mod bus;
pub mod connection;
pub mod delivery;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod supervisor;

pub use broadcast::{BroadcastEngine, BroadcastReport};
pub use bus::{BusBridge, BusHandler};
pub use connection::{Connection, FrameSink};
pub use delivery::{BusChatDelivery, ChatDelivery};
pub use hub::{ActiveConnection, ConnectionState, SessionHub};
pub use presence::PresenceService;
pub use registry::ConnectionRegistry;
pub use supervisor::{run_isolated, spawn_isolated};
