//! Typed pub/sub for coordinator events.

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{QueueEvent, Resolution};
pub use handler::{QueueEventHandlers, SubscriptionHandle, spawn_listener};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
