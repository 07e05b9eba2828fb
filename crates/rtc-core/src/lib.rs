//! RTC Core - Shared types, signaling protocol, and token validation
//!
//! This crate contains the foundational types used by the signal server and
//! the embed client. It has no dependencies on networking code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use config::{AuthConfig, ClientConfig, Config, ConfigError, LoaderConfig, SignalConfig};
pub use error::*;
pub use identity::{AuthContext, IdentityRecord, TokenVerifier, Validator};
pub use protocol::*;
pub use types::*;

/// Default signal server port
pub const DEFAULT_PORT: u16 = 8080;

/// Sessions idle for longer than this are finalized by the sweeper (seconds)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// One-to-one calling
pub const MAX_PARTICIPANTS: usize = 2;

/// Maximum SDP or ICE candidate payload (64 KB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Coordinator code release the loader fetches by default
pub const DEFAULT_RELEASE_VERSION: &str = "20250818-023";

/// Wire protocol version announced in `hello`
pub const PROTOCOL_VERSION: u32 = 1;
