//! Connection relay between a terminated client session and the real server
//!
//! Each session runs two independent directional tasks. A clean end of stream
//! on one side is passed on as a TLS close to the other side and the opposite
//! direction keeps draining. A read or write failure aborts the paired
//! direction as well. Either way both tasks are joined before the session is
//! reported closed; each transport is split across both tasks, so neither is
//! released while the other task still holds it.

use crate::config::InterceptConfig;
use crate::error::{Error, Result};
use crate::listener::{crypto_provider, IncomingConnection};
use crate::observe::{Direction, LineFramer, TrafficRecord, TrafficSink, MAX_LINE_LEN};
use rustls_pki_types::ServerName;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Size of the raw chunks forwarded in each direction (8 KiB)
const CHUNK_SIZE: usize = 8 * 1024;

/// How one direction of a session ended
#[derive(Debug)]
pub enum Termination {
  /// Source reached end of stream; destination was closed for writing
  Eof,
  /// The paired direction failed first
  Aborted,
  /// Reading from the source failed
  ReadFailed(io::Error),
  /// Writing to the destination failed
  WriteFailed(io::Error),
}

impl Termination {
  /// Whether this direction ended with an error of its own
  pub fn is_error(&self) -> bool {
    matches!(self, Termination::ReadFailed(_) | Termination::WriteFailed(_))
  }
}

impl fmt::Display for Termination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Termination::Eof => f.write_str("end of stream"),
      Termination::Aborted => f.write_str("aborted by paired direction"),
      Termination::ReadFailed(e) => write!(f, "error reading: {}", e),
      Termination::WriteFailed(e) => write!(f, "error writing: {}", e),
    }
  }
}

/// Outcome of a finished session
#[derive(Debug)]
pub struct SessionReport {
  /// Session identifier
  pub id: u64,
  /// How the upstream to client direction ended
  pub server_to_client: Termination,
  /// How the client to upstream direction ended
  pub client_to_server: Termination,
}

/// Dials the real server and relays sessions to it
pub struct Relay {
  connector: TlsConnector,
  upstream_addr: String,
  server_name: ServerName<'static>,
  connect_timeout: Duration,
  sink: Arc<dyn TrafficSink>,
}

impl Relay {
  /// Create a relay for the configured upstream, reporting plaintext to `sink`.
  pub fn new(config: &InterceptConfig, sink: Arc<dyn TrafficSink>) -> Result<Self> {
    let mut roots = RootCertStore::empty();
    if config.native_roots {
      let native = rustls_native_certs::load_native_certs();
      for e in &native.errors {
        tracing::debug!("skipping native root: {}", e);
      }
      let (added, ignored) = roots.add_parsable_certificates(native.certs);
      tracing::debug!(added, ignored, "loaded native roots");
    }
    for cert in &config.upstream_roots {
      roots.add(cert.clone())?;
    }

    let tls = ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()?
      .with_root_certificates(roots)
      .with_no_client_auth();

    Ok(Self {
      connector: TlsConnector::from(Arc::new(tls)),
      upstream_addr: config.upstream_addr.clone(),
      server_name: config.tls_server_name()?,
      connect_timeout: config.connect_timeout,
      sink,
    })
  }

  /// Dial the upstream over TLS, verifying it presents the configured name.
  ///
  /// There is no retry; a failure is final for the session.
  pub async fn dial(&self) -> Result<TlsStream<TcpStream>> {
    let connect = async {
      let stream = TcpStream::connect(&self.upstream_addr).await?;
      stream.set_nodelay(true)?;
      self
        .connector
        .connect(self.server_name.clone(), stream)
        .await
    };
    let source = match tokio::time::timeout(self.connect_timeout, connect).await {
      Ok(Ok(stream)) => return Ok(stream),
      Ok(Err(e)) => e,
      Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
    };
    Err(Error::Dial {
      addr: self.upstream_addr.clone(),
      source,
    })
  }

  /// Relay one accepted connection until both directions have ended.
  ///
  /// Dial and handshake failures drop the client connection and affect no
  /// other session. Every session logs exactly one start and one end line.
  pub async fn handle(&self, id: u64, client: IncomingConnection) -> Result<SessionReport> {
    tracing::info!(session = id, peer = %client.peer_addr(), "session started");
    let result = self.relay_session(id, client).await;
    if let Err(e) = &result {
      tracing::warn!(session = id, "failed to accept connection: {}", e);
    }
    tracing::info!(session = id, "end connection {}", id);
    result
  }

  async fn relay_session(&self, id: u64, client: IncomingConnection) -> Result<SessionReport> {
    let upstream = self.dial().await?;
    let client = client.handshake().await?;

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let (abort, _) = watch::channel(false);
    let abort = Arc::new(abort);

    let server_to_client = tokio::spawn(pipe(
      self.pipe_context(id, Direction::ServerToClient, &abort),
      upstream_read,
      client_write,
    ));
    let client_to_server = tokio::spawn(pipe(
      self.pipe_context(id, Direction::ClientToServer, &abort),
      client_read,
      upstream_write,
    ));

    let (server_to_client, client_to_server) = tokio::join!(server_to_client, client_to_server);
    Ok(SessionReport {
      id,
      server_to_client: joined(server_to_client),
      client_to_server: joined(client_to_server),
    })
  }

  fn pipe_context(
    &self,
    session: u64,
    direction: Direction,
    abort: &Arc<watch::Sender<bool>>,
  ) -> PipeContext {
    PipeContext {
      session,
      direction,
      label: direction.label(session),
      sink: self.sink.clone(),
      abort: abort.clone(),
    }
  }
}

fn joined(result: std::result::Result<Termination, tokio::task::JoinError>) -> Termination {
  result.unwrap_or_else(|e| Termination::ReadFailed(io::Error::other(e)))
}

struct PipeContext {
  session: u64,
  direction: Direction,
  label: String,
  sink: Arc<dyn TrafficSink>,
  abort: Arc<watch::Sender<bool>>,
}

impl PipeContext {
  fn emit(&self, line: bytes::Bytes) {
    self.sink.record(TrafficRecord {
      session: self.session,
      direction: self.direction,
      line,
    });
  }
}

/// Resolves once the paired direction reports a failure.
async fn paired_failed(aborted: &mut watch::Receiver<bool>) {
  // the sender outlives both pipes, so an error here cannot mean "not aborted"
  let _ = aborted.wait_for(|aborted| *aborted).await;
}

/// Read raw chunks from `src` and write them unmodified to `dst`, reporting
/// each line to the sink on the way.
async fn pipe<R, W>(ctx: PipeContext, mut src: R, mut dst: W) -> Termination
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut aborted = ctx.abort.subscribe();
  let mut framer = LineFramer::new(MAX_LINE_LEN);
  let mut buf = vec![0u8; CHUNK_SIZE];

  let termination = loop {
    let n = tokio::select! {
      read = src.read(&mut buf) => match read {
        Ok(0) => break Termination::Eof,
        Ok(n) => n,
        Err(e) => break Termination::ReadFailed(e),
      },
      _ = paired_failed(&mut aborted) => break Termination::Aborted,
    };

    for line in framer.push(&buf[..n]) {
      ctx.emit(line);
    }

    let write = async {
      dst.write_all(&buf[..n]).await?;
      dst.flush().await
    };
    tokio::select! {
      written = write => if let Err(e) = written {
        break Termination::WriteFailed(e);
      },
      _ = paired_failed(&mut aborted) => break Termination::Aborted,
    }
  };

  if let Some(rest) = framer.finish() {
    ctx.emit(rest);
  }

  match &termination {
    Termination::Eof => {
      // pass the close on so the peer sees end of stream for this direction
      if let Err(e) = dst.shutdown().await {
        tracing::debug!("({}) {}: shutdown failed: {}", ctx.label, ctx.direction, e);
      }
      tracing::debug!("({}) {}: end of stream", ctx.label, ctx.direction);
    }
    Termination::Aborted => {
      tracing::debug!("({}) {}: aborted", ctx.label, ctx.direction);
    }
    Termination::ReadFailed(_) | Termination::WriteFailed(_) => {
      ctx.abort.send_replace(true);
      tracing::warn!("({}) {}", termination, ctx.label);
    }
  }
  termination
}
