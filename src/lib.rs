#![deny(missing_docs)]

//! # mitm-relay
//!
//! An interactive, transparent TLS man-in-the-middle relay for one hostname.
//!
//! The relay terminates inbound TLS with a leaf certificate issued on the fly
//! by an ephemeral root, dials the real server over TLS, and prints the
//! plaintext of both directions while forwarding it unmodified.
//!
//! - Ephemeral P-256 root and leaf, valid for one hour
//! - One session per connection, two independent directional tasks each
//! - Raw chunk forwarding with line-framed observability
//! - Optional installation of the root into the macOS system keychain
//!
//! ## Embedding the relay
//!
//! ```no_run
//! use mitm_relay::{InterceptConfig, InterceptListener, Relay, Server, StdoutSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = InterceptConfig::builder()
//!     .listen_addr("127.0.0.1:8443")
//!     .upstream_addr("93.184.216.34:443")
//!     .server_name("example.com")
//!     .build()?;
//!   let (listener, _root) = InterceptListener::bind(&config).await?;
//!   let relay = Relay::new(&config, Arc::new(StdoutSink))?;
//!   Server::new(listener, relay).run().await?;
//!   Ok(())
//! }
//! ```
//!
//! Traffic lines look like `#0 < GET / HTTP/1.1` (client to server) and
//! `#0 > HTTP/1.1 200 OK` (server to client).

mod ca;
mod config;
mod error;
mod listener;
mod observe;
mod relay;
mod server;
mod trust;

pub use ca::{
  der_to_pem, generate_leaf, generate_root, CertificateAuthority, LeafCertificate, CA_COMMON_NAME,
};
pub use config::{
  InterceptConfig, InterceptConfigBuilder, DEFAULT_LISTEN_ADDR, ROOT_CERT_FILE_NAME,
};
pub use error::{Error, Result};
pub use listener::{IncomingConnection, InterceptListener};
pub use observe::{
  ChannelSink, Direction, LineFramer, StdoutSink, TrafficRecord, TrafficSink, MAX_LINE_LEN,
};
pub use relay::{Relay, SessionReport, Termination};
pub use server::Server;
pub use trust::{write_root_pem, NoopTrustStore, SystemKeychain, TrustStore, SYSTEM_KEYCHAIN};
