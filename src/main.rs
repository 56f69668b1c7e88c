use anyhow::{Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use mitm_relay::{
  InterceptConfig, InterceptListener, NoopTrustStore, Relay, Server, StdoutSink, SystemKeychain,
  TrustStore, DEFAULT_LISTEN_ADDR,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Intercepts and prints decrypted TLS traffic between local clients and one
/// upstream server, generating a trusted certificate chain on the fly.
#[derive(Parser, Debug)]
#[command(name = "mitm-relay")]
#[command(version, about)]
struct Args {
  /// Local address to listen on.
  #[arg(long, default_value = DEFAULT_LISTEN_ADDR, value_parser = NonEmptyStringValueParser::new())]
  laddr: String,

  /// Remote address to upstream data to.
  #[arg(long, value_parser = NonEmptyStringValueParser::new())]
  raddr: String,

  /// SNI to accept and offer.
  #[arg(long, value_parser = NonEmptyStringValueParser::new())]
  sni: String,

  /// Extra PEM trust anchors for the upstream connection (repeatable).
  #[arg(long = "upstream-ca")]
  upstream_ca: Vec<PathBuf>,

  /// Do not load the operating system roots for the upstream connection.
  #[arg(long)]
  no_native_roots: bool,

  /// Upstream connect and handshake timeout, in seconds.
  #[arg(long, default_value_t = 10)]
  connect_timeout: u64,

  /// Where the root certificate is written for the trust store.
  #[arg(long)]
  root_cert_path: Option<PathBuf>,

  /// Only write the root certificate; do not touch the system trust store.
  #[arg(long)]
  no_trust: bool,

  /// Keychain to install the root into (macOS only).
  #[arg(long)]
  keychain: Option<PathBuf>,

  /// Output logs as JSON
  #[arg(long)]
  log_json: bool,
}

fn init_tracing(json: bool) {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mitm_relay=info"));
  // stdout is reserved for the intercepted traffic
  if json {
    tracing_subscriber::fmt()
      .json()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .init();
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .init();
  }
}

fn build_config(args: &Args) -> Result<InterceptConfig> {
  let mut builder = InterceptConfig::builder()
    .listen_addr(&args.laddr)
    .upstream_addr(&args.raddr)
    .server_name(&args.sni)
    .native_roots(!args.no_native_roots)
    .connect_timeout(Duration::from_secs(args.connect_timeout));
  for path in &args.upstream_ca {
    builder = builder.upstream_roots_pem(path)?;
  }
  if let Some(path) = &args.root_cert_path {
    builder = builder.root_cert_path(path);
  }
  Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.log_json);

  let config = build_config(&args).context("invalid configuration")?;
  let (listener, root) = InterceptListener::bind(&config)
    .await
    .context("failed to start interception listener")?;
  let relay = Relay::new(&config, Arc::new(StdoutSink)).context("failed to configure relay")?;

  let trust: Box<dyn TrustStore> = if args.no_trust || !cfg!(target_os = "macos") {
    if !args.no_trust {
      tracing::warn!("system trust store is only managed on macOS");
    }
    Box::new(NoopTrustStore::new(&config.root_cert_path))
  } else {
    let store = SystemKeychain::new(&config.root_cert_path);
    match &args.keychain {
      Some(keychain) => Box::new(store.keychain(keychain)),
      None => Box::new(store),
    }
  };
  trust
    .install_root(&root)
    .await
    .context("failed to add root to trust store")?;

  let served = Server::new(listener, relay).run().await;
  trust
    .remove_root()
    .await
    .context("failed to remove root from trust store")?;
  served?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::error::ErrorKind;

  #[test]
  fn test_required_options() {
    let err = Args::try_parse_from(["mitm-relay", "--sni", "example.com"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
  }

  #[test]
  fn test_empty_values_are_usage_errors() {
    for args in [
      ["mitm-relay", "--raddr", "", "--sni", "example.com"],
      ["mitm-relay", "--raddr", "127.0.0.1:8443", "--sni", ""],
      ["mitm-relay", "--laddr", "", "--sni", "example.com"],
    ] {
      let err = Args::try_parse_from(args).unwrap_err();
      assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }
  }

  #[test]
  fn test_defaults() {
    let args =
      Args::try_parse_from(["mitm-relay", "--raddr", "127.0.0.1:8443", "--sni", "example.com"])
        .unwrap();
    assert_eq!(args.laddr, DEFAULT_LISTEN_ADDR);
    assert_eq!(args.connect_timeout, 10);
    assert!(args.keychain.is_none());
    assert!(build_config(&args).is_ok());
  }
}
