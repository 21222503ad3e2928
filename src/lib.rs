//! Readmark: live reading presence
//!
//! Shows where other readers are in the same piece of content. One shared
//! push connection per device feeds a presence table per room; a timeline
//! turns that table into animated markers.

pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod presence;
pub mod server;
pub mod time;
pub mod timeline;
pub mod transport;

pub use bus::{EventBus, EventRx};
pub use client::PresenceClient;
pub use error::{PresenceError, Result};
pub use event::CanonicalEvent;
pub use presence::{FormFactor, PresenceRecord, RoomSnapshot};
pub use timeline::{MarkerFrame, Timeline, Viewport};
pub use transport::{ConnectionState, TransportProxy};
