//! Authorizing reverse proxy for the Aviso notification store.
//!
//! Clients send etcd v3 JSON range and watch requests; the proxy checks the
//! requested key interval against the caller's permitted prefixes before
//! forwarding the untouched body to the backend.

pub mod authoriser;
pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod permissions;
pub mod range;
pub mod server;

pub use authoriser::{Authoriser, Decision, Outcome, Verdict};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use server::{build_app, run, ProxyState};
