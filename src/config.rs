//! Relay configuration
//!
//! Built once at startup and shared by reference afterwards; no component reads
//! process-wide state.

use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, ServerName};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default local address, as for a transparent HTTPS interception
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:443";
/// File name of the PEM hand-off for the trust store
pub const ROOT_CERT_FILE_NAME: &str = "mitm_root.crt";

/// Immutable configuration for the interception relay
#[derive(Clone, Debug)]
pub struct InterceptConfig {
  /// Address the interception listener binds to
  pub listen_addr: String,
  /// Address of the real server
  pub upstream_addr: String,
  /// Hostname the leaf is issued for and the upstream must present
  pub server_name: String,
  /// Extra trust anchors for the upstream dial
  pub upstream_roots: Vec<CertificateDer<'static>>,
  /// Load the operating system roots for the upstream dial
  pub native_roots: bool,
  /// Bound on upstream TCP connect plus TLS handshake
  pub connect_timeout: Duration,
  /// Where the root is written in PEM form for the trust store
  pub root_cert_path: PathBuf,
}

impl InterceptConfig {
  /// Start building a configuration.
  pub fn builder() -> InterceptConfigBuilder {
    InterceptConfigBuilder::default()
  }

  /// Validated TLS server name for the upstream dial
  pub fn tls_server_name(&self) -> Result<ServerName<'static>> {
    ServerName::try_from(self.server_name.clone())
      .map_err(|_| Error::InvalidServerName(self.server_name.clone()))
  }
}

/// Builder for [`InterceptConfig`]
#[derive(Clone, Debug)]
pub struct InterceptConfigBuilder {
  listen_addr: String,
  upstream_addr: Option<String>,
  server_name: Option<String>,
  upstream_roots: Vec<CertificateDer<'static>>,
  native_roots: bool,
  connect_timeout: Duration,
  root_cert_path: PathBuf,
}

impl Default for InterceptConfigBuilder {
  fn default() -> Self {
    Self {
      listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
      upstream_addr: None,
      server_name: None,
      upstream_roots: Vec::new(),
      native_roots: true,
      connect_timeout: Duration::from_secs(10),
      root_cert_path: std::env::temp_dir().join(ROOT_CERT_FILE_NAME),
    }
  }
}

impl InterceptConfigBuilder {
  /// Set the local listen address.
  pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
    self.listen_addr = addr.into();
    self
  }

  /// Set the upstream address.
  pub fn upstream_addr(mut self, addr: impl Into<String>) -> Self {
    self.upstream_addr = Some(addr.into());
    self
  }

  /// Set the intercepted hostname.
  pub fn server_name(mut self, name: impl Into<String>) -> Self {
    self.server_name = Some(name.into());
    self
  }

  /// Trust an additional root when dialing upstream.
  pub fn upstream_root(mut self, cert: CertificateDer<'static>) -> Self {
    self.upstream_roots.push(cert);
    self
  }

  /// Trust every certificate found in a PEM file when dialing upstream.
  pub fn upstream_roots_pem(mut self, path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let pem = std::fs::read(path)
      .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::config(format!("invalid PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
      return Err(Error::config(format!(
        "no certificate found in {}",
        path.display()
      )));
    }
    self.upstream_roots.extend(certs);
    Ok(self)
  }

  /// Controls loading of the operating system roots.
  ///
  /// Defaults to `true`.
  pub fn native_roots(mut self, value: bool) -> Self {
    self.native_roots = value;
    self
  }

  /// Set the upstream connect timeout.
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Set the PEM hand-off path.
  pub fn root_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.root_cert_path = path.into();
    self
  }

  /// Validate and build the configuration.
  pub fn build(self) -> Result<InterceptConfig> {
    if self.listen_addr.is_empty() {
      return Err(Error::config("local listen address is required"));
    }
    let upstream_addr = self
      .upstream_addr
      .filter(|addr| !addr.is_empty())
      .ok_or_else(|| Error::config("upstream address is required"))?;
    let server_name = self
      .server_name
      .filter(|name| !name.is_empty())
      .ok_or_else(|| Error::config("target hostname (SNI) is required"))?;
    if !self.native_roots && self.upstream_roots.is_empty() {
      return Err(Error::config(
        "no upstream trust anchors: enable native roots or add an upstream CA",
      ));
    }

    let config = InterceptConfig {
      listen_addr: self.listen_addr,
      upstream_addr,
      server_name,
      upstream_roots: self.upstream_roots,
      native_roots: self.native_roots,
      connect_timeout: self.connect_timeout,
      root_cert_path: self.root_cert_path,
    };
    config.tls_server_name()?;
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::CertificateAuthority;

  #[test]
  fn test_defaults() {
    let config = InterceptConfig::builder()
      .upstream_addr("93.184.216.34:443")
      .server_name("example.com")
      .build()
      .unwrap();
    assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
    assert!(config.native_roots);
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert!(config.root_cert_path.ends_with(ROOT_CERT_FILE_NAME));
  }

  #[test]
  fn test_mandatory_options() {
    let missing_upstream = InterceptConfig::builder().server_name("example.com").build();
    assert!(matches!(missing_upstream, Err(Error::Config(_))));

    let missing_sni = InterceptConfig::builder()
      .upstream_addr("127.0.0.1:8443")
      .build();
    assert!(matches!(missing_sni, Err(Error::Config(_))));

    let empty_listen = InterceptConfig::builder()
      .listen_addr("")
      .upstream_addr("127.0.0.1:8443")
      .server_name("example.com")
      .build();
    assert!(matches!(empty_listen, Err(Error::Config(_))));
  }

  #[test]
  fn test_invalid_server_name() {
    let result = InterceptConfig::builder()
      .upstream_addr("127.0.0.1:8443")
      .server_name("bad name")
      .build();
    assert!(matches!(result, Err(Error::InvalidServerName(_))));
  }

  #[test]
  fn test_requires_some_trust_anchor() {
    let result = InterceptConfig::builder()
      .upstream_addr("127.0.0.1:8443")
      .server_name("example.com")
      .native_roots(false)
      .build();
    assert!(matches!(result, Err(Error::Config(_))));
  }

  #[test]
  fn test_upstream_roots_from_pem() {
    let ca = CertificateAuthority::generate().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upstream.pem");
    std::fs::write(&path, ca.root_pem()).unwrap();

    let config = InterceptConfig::builder()
      .upstream_addr("127.0.0.1:8443")
      .server_name("example.com")
      .native_roots(false)
      .upstream_roots_pem(&path)
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(config.upstream_roots, vec![ca.root_der().clone()]);

    let empty = dir.path().join("empty.pem");
    std::fs::write(&empty, "").unwrap();
    assert!(InterceptConfig::builder().upstream_roots_pem(&empty).is_err());
  }
}
