//! Trust store adapters
//!
//! The root is handed to the operating system through a PEM file at a fixed
//! path. Installation and removal happen once each, at startup and shutdown.

use crate::ca::{der_to_pem, CA_COMMON_NAME};
use crate::error::{Error, Result};
use rustls_pki_types::CertificateDer;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// System keychain used by [`SystemKeychain`]
pub const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Makes the generated root trusted by clients on this host
#[async_trait::async_trait]
pub trait TrustStore: Send + Sync {
  /// Trust `root` for subsequent TLS validations
  async fn install_root(&self, root: &CertificateDer<'static>) -> Result<()>;

  /// Undo [`TrustStore::install_root`]
  async fn remove_root(&self) -> Result<()>;
}

/// Write `root` in PEM form to `path`.
pub async fn write_root_pem(path: &Path, root: &CertificateDer<'_>) -> Result<()> {
  let mut file = tokio::fs::File::create(path).await?;
  file.write_all(der_to_pem(root).as_bytes()).await?;
  file.flush().await?;
  Ok(())
}

/// macOS system keychain, driven through the `security` tool
#[derive(Clone, Debug)]
pub struct SystemKeychain {
  cert_path: PathBuf,
  keychain: PathBuf,
}

impl SystemKeychain {
  /// Use the system keychain, handing the root over at `cert_path`
  pub fn new(cert_path: impl Into<PathBuf>) -> Self {
    Self {
      cert_path: cert_path.into(),
      keychain: PathBuf::from(SYSTEM_KEYCHAIN),
    }
  }

  /// Use another keychain file
  pub fn keychain(mut self, keychain: impl Into<PathBuf>) -> Self {
    self.keychain = keychain.into();
    self
  }
}

#[async_trait::async_trait]
impl TrustStore for SystemKeychain {
  async fn install_root(&self, root: &CertificateDer<'static>) -> Result<()> {
    write_root_pem(&self.cert_path, root).await?;
    run(
      "security",
      &[
        OsStr::new("add-trusted-cert"),
        OsStr::new("-d"),
        OsStr::new("-r"),
        OsStr::new("trustRoot"),
        OsStr::new("-k"),
        self.keychain.as_os_str(),
        self.cert_path.as_os_str(),
      ],
    )
    .await
    .map_err(|e| Error::trust_store(format!("failed to add to trust store: {}", e)))?;
    tracing::info!(path = %self.cert_path.display(), "root added to trust store");
    Ok(())
  }

  async fn remove_root(&self) -> Result<()> {
    run(
      "security",
      &[
        OsStr::new("remove-trusted-cert"),
        OsStr::new("-d"),
        self.cert_path.as_os_str(),
      ],
    )
    .await
    .map_err(|e| Error::trust_store(format!("failed to remove from trust store: {}", e)))?;
    run(
      "security",
      &[
        OsStr::new("delete-certificate"),
        OsStr::new("-c"),
        OsStr::new(CA_COMMON_NAME),
        self.keychain.as_os_str(),
      ],
    )
    .await
    .map_err(|e| Error::trust_store(format!("failed to remove from keychain: {}", e)))?;
    tracing::info!("root removed from trust store");
    Ok(())
  }
}

/// Only writes the PEM hand-off file; trust is left to the operator
#[derive(Clone, Debug)]
pub struct NoopTrustStore {
  cert_path: PathBuf,
}

impl NoopTrustStore {
  /// Write the root to `cert_path` on install
  pub fn new(cert_path: impl Into<PathBuf>) -> Self {
    Self {
      cert_path: cert_path.into(),
    }
  }
}

#[async_trait::async_trait]
impl TrustStore for NoopTrustStore {
  async fn install_root(&self, root: &CertificateDer<'static>) -> Result<()> {
    write_root_pem(&self.cert_path, root).await?;
    tracing::info!(
      path = %self.cert_path.display(),
      "root written; add it to the client's trust store manually"
    );
    Ok(())
  }

  async fn remove_root(&self) -> Result<()> {
    Ok(())
  }
}

async fn run(program: &str, args: &[&OsStr]) -> std::result::Result<(), String> {
  let output = Command::new(program)
    .args(args)
    .output()
    .await
    .map_err(|e| format!("failed to run {}: {}", program, e))?;
  if output.status.success() {
    Ok(())
  } else {
    Err(failure_summary(&output))
  }
}

fn failure_summary(output: &Output) -> String {
  let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
  if !stderr.is_empty() {
    return stderr;
  }
  match output.status.code() {
    Some(code) => format!("exit code {}", code),
    None => "terminated by signal".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::CertificateAuthority;

  #[tokio::test]
  async fn test_noop_writes_pem_hand_off() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mitm_root.crt");
    let ca = CertificateAuthority::generate().unwrap();

    let store = NoopTrustStore::new(&path);
    store.install_root(ca.root_der()).await.unwrap();
    let pem = std::fs::read(&path).unwrap();
    let parsed = rustls_pemfile::certs(&mut pem.as_slice())
      .next()
      .unwrap()
      .unwrap();
    assert_eq!(&parsed, ca.root_der());
    assert!(store.remove_root().await.is_ok());
  }

  #[test]
  fn test_keychain_override() {
    let store = SystemKeychain::new("/tmp/mitm_root.crt");
    assert_eq!(store.keychain, PathBuf::from(SYSTEM_KEYCHAIN));
    let store = store.keychain("/tmp/login.keychain-db");
    assert_eq!(store.keychain, PathBuf::from("/tmp/login.keychain-db"));
    assert_eq!(store.cert_path, PathBuf::from("/tmp/mitm_root.crt"));
  }

  #[tokio::test]
  async fn test_failed_command_reports_stderr() {
    let err = run("sh", &[OsStr::new("-c"), OsStr::new("echo denied >&2; exit 3")])
      .await
      .unwrap_err();
    assert_eq!(err, "denied");

    let err = run("sh", &[OsStr::new("-c"), OsStr::new("exit 4")])
      .await
      .unwrap_err();
    assert_eq!(err, "exit code 4");

    assert!(run("sh", &[OsStr::new("-c"), OsStr::new("true")]).await.is_ok());
  }

  #[tokio::test]
  async fn test_missing_tool_is_an_error() {
    let err = run("mitm-relay-no-such-tool", &[]).await.unwrap_err();
    assert!(err.contains("failed to run"));
  }
}
