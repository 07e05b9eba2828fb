//! RTC Signal Server
//!
//! Session registry, call state machine and signaling relay for one-to-one
//! WebRTC calls. Clients connect via WebSocket (or in-process through
//! [`Hub::connect`]) to exchange session descriptions and ICE candidates.
//!
//! # Protocol
//!
//! 1. Client sends `hello` with its user id and auth token
//! 2. Client joins a session by id; the first member creates it
//! 3. The relay forwards offer, answer and candidates to the other member
//! 4. The call state machine follows the exchange to `active`
//! 5. Hangup, leave or idle timeout ends the session; the sweeper evicts it

pub mod call;
pub mod connection;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

pub use call::{CallEvent, CallMachine};
pub use connection::{Connection, Hub};
pub use messages::ChannelMessage;
pub use registry::{Eviction, SessionRegistry, SessionSnapshot};
pub use relay::{Ack, Delivery, SignalingRelay, Subscription};
pub use server::SignalServer;
pub use storage::{Storage, StorageError};
