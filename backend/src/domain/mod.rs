//! Domain entities, ports, and services.
//!
//! Nothing in this module may depend on HTTP, Diesel, or any other adapter
//! concern; adapters depend on this module, never the other way round.

pub mod config;
pub mod credits;
pub mod error;
pub mod ids;
pub mod ports;
pub mod slots;
pub mod synthesis;
pub mod voices;
pub mod worker;

pub use self::config::{AppConfig, ConfigError};
pub use self::error::{Error, ErrorCode};
pub use self::ids::{EventId, JobId, LotId, StoryId, TxId, UserId, VoiceId};
