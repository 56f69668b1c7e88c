//! Interception listener: binds generated key material to a network identity

use crate::ca::CertificateAuthority;
use crate::config::InterceptConfig;
use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// TLS listener presenting `[leaf, root]` for the intercepted hostname
pub struct InterceptListener {
  listener: TcpListener,
  acceptor: TlsAcceptor,
  local_addr: SocketAddr,
}

impl InterceptListener {
  /// Generate the root and leaf, build the TLS server identity and bind
  /// `config.listen_addr`.
  ///
  /// Returns the live listener and the root certificate, which the trust store
  /// needs. Nothing is bound if certificate generation fails.
  pub async fn bind(config: &InterceptConfig) -> Result<(Self, CertificateDer<'static>)> {
    let ca = CertificateAuthority::generate()?;
    let leaf = ca.issue(&config.server_name)?;
    let root = ca.root_der().clone();
    let tls_config = create_tls_server_config(leaf.chain(&root), leaf.key_der)?;

    let listener = TcpListener::bind(&config.listen_addr)
      .await
      .map_err(|source| Error::Bind {
        addr: config.listen_addr.clone(),
        source,
      })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, sni = %config.server_name, "interception listener bound");

    Ok((
      Self {
        listener,
        acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        local_addr,
      },
      root,
    ))
  }

  /// Address actually bound, useful with port `0`
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Accept the next TCP connection.
  ///
  /// The TLS handshake is left to the session so a slow client never stalls
  /// the accept loop.
  pub async fn accept(&self) -> Result<IncomingConnection> {
    let (stream, peer_addr) = self.listener.accept().await?;
    Ok(IncomingConnection {
      stream,
      peer_addr,
      acceptor: self.acceptor.clone(),
    })
  }
}

/// Accepted client connection awaiting its TLS handshake
pub struct IncomingConnection {
  stream: TcpStream,
  peer_addr: SocketAddr,
  acceptor: TlsAcceptor,
}

impl IncomingConnection {
  /// Client address
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Terminate the client's TLS session with the leaf certificate.
  pub async fn handshake(self) -> Result<TlsStream<TcpStream>> {
    let peer = self.peer_addr;
    self.stream.set_nodelay(true)?;
    self
      .acceptor
      .accept(self.stream)
      .await
      .map_err(|source| Error::Handshake { peer, source })
  }
}

/// Process-wide crypto provider, falling back to `ring`
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(ring::default_provider()))
}

/// Create TLS server configuration
fn create_tls_server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(listen_addr: &str) -> InterceptConfig {
    InterceptConfig::builder()
      .listen_addr(listen_addr)
      .upstream_addr("127.0.0.1:9")
      .server_name("example.com")
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_bind_ephemeral_port() {
    let (listener, root) = InterceptListener::bind(&config("127.0.0.1:0")).await.unwrap();
    assert_ne!(listener.local_addr().port(), 0);
    assert!(!root.is_empty());
  }

  #[tokio::test]
  async fn test_bind_failure_is_fatal() {
    let (first, _) = InterceptListener::bind(&config("127.0.0.1:0")).await.unwrap();
    let taken = first.local_addr().to_string();
    let err = match InterceptListener::bind(&config(&taken)).await {
      Ok(_) => panic!("second bind on {} should fail", taken),
      Err(e) => e,
    };
    assert!(matches!(err, Error::Bind { .. }));
    assert!(err.is_fatal());
  }

  #[test]
  fn test_server_config_from_generated_chain() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.issue("example.com").unwrap();
    let chain = leaf.chain(ca.root_der());
    assert_eq!(chain.len(), 2);
    assert!(create_tls_server_config(chain, leaf.key_der).is_ok());
  }
}
