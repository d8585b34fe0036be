//! socks5lb - SOCKS5-aware TCP load balancer
//!
//! Accepts client connections and passes them through to one of several
//! upstream SOCKS5 proxies, selected round-robin with failover over the
//! healthy subset of a continuously health-checked pool. A transparent
//! proxy mode (Linux) intercepts kernel-redirected traffic and forwards it
//! through a periodically refreshed upstream.

pub mod config;
pub mod lb;
pub mod server;
pub mod transport;

pub use config::Config;
pub use lb::{Backend, BackendCheckConfig, Pool};
pub use server::Server;

/// Application name, as reported by the admin interface
pub const APP_NAME: &str = "socks5lb";
