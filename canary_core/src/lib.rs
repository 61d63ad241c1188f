//! Stack canary reconnaissance over a crash oracle.
//!
//! A [`Transport`] sends a payload to the target and reports whether it survived.
//! [`discover`] finds the padding length at which input reaches the canary, and
//! [`recover`] rebuilds the canary byte by byte on top of that offset.

pub mod canary;
pub mod config;
pub mod discover;
pub mod oracle;
pub mod payload;
pub mod transport;

pub use canary::{BruteForceError, BruteForceParams, Canary, recover};
pub use config::{CanaryConfig, ConfigError, Endpoint, SearchSettings, SerialSpec, TransportConfig};
pub use discover::{DiscoverError, DiscoverParams, OffsetBracket, discover, discover_linear};
pub use oracle::CrashOracle;
pub use payload::{PayloadBuilder, PayloadError};
pub use transport::{Transport, TransportError};
