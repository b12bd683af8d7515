//! veilgate runtime.
//!
//! A TLS tunnel that looks like an ordinary HTTPS server from the outside:
//! authenticated clients get their traffic relayed to arbitrary TCP/UDP
//! destinations, everyone else is silently served by a decoy web server.
//! `server` holds the dispatcher that makes that call; `client`, `tproxy`
//! and `forward` are the three local-side runtimes; the rest are the shared
//! building blocks.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod logging;
pub mod meter;
pub mod mux;
pub mod nat;
pub mod net;
pub mod relay;
pub mod router;
pub mod server;
pub mod tls;
#[cfg(target_os = "linux")]
pub mod tproxy;

pub use auth::{CredentialStore, SqlStore, StaticStore, UserStat};
pub use config::{Config, RunType};
pub use error::{Error, Result};
pub use meter::{NullMeter, SqlMeter, TrafficMeter};
pub use router::Router;
pub use server::Server;
