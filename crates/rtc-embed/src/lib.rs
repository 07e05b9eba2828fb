//! RTC Embed - Client side of an embedded one-to-one call
//!
//! This crate provides:
//! - Embedding attributes (`user-name`, `user-id`, `user-avatar`, `user-token`)
//! - Host events (`WEBRTC_READY`, `WEBRTC_ERROR`, `WEBRTC_MESSAGE`)
//! - The coordinator code loader with cache-bust or pinned fetch policies
//! - Signaling channels over WebSocket or to an in-process hub
//! - The `ClientCoordinator` that drives a call through the relay
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  HostEvent (mpsc)  ┌──────────────────────────┐
//! │     Host     │◄───────────────────│    ClientCoordinator     │
//! └──────────────┘                    │  start / join / hangup   │
//!                                     └────────────┬─────────────┘
//!                                                  │ Outbound queue
//!                                                  ▼
//!                 MediaEngine ◄──────────── signaling pump task
//!                                                  │ SignalChannel
//!                                                  ▼
//!                                    rtc-signal relay (WS or local)
//! ```

pub mod attributes;
pub mod channel;
pub mod coordinator;
pub mod events;
pub mod loader;
pub mod media;

pub use attributes::EmbedAttributes;
pub use channel::{Connector, LocalConnector, SignalChannel, WsConnector};
pub use coordinator::{ClientCoordinator, CoordinatorState, StartOutcome};
pub use events::{HostEvent, HostEvents, HostNotifier};
pub use loader::{CoordinatorCode, CoordinatorLoader, FetchPolicy};
pub use media::{MediaEngine, MediaError, RenderTarget, SyntheticMedia};
