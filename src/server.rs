//! Accept loop

use crate::error::Result;
use crate::listener::InterceptListener;
use crate::relay::Relay;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Interception server: one relay session per accepted connection
pub struct Server {
  listener: InterceptListener,
  relay: Arc<Relay>,
}

impl Server {
  /// Create a server from a bound listener and a relay
  pub fn new(listener: InterceptListener, relay: Relay) -> Self {
    Self {
      listener,
      relay: Arc::new(relay),
    }
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.listener.local_addr()
  }

  /// Run the proxy server until `shutdown` resolves.
  ///
  /// Sessions are numbered from `0` in acceptance order. On shutdown the
  /// listener is closed; sessions already running are not cancelled and end
  /// on their own.
  pub async fn run_until<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    tracing::info!(addr = %self.local_addr(), "started");

    let mut next_id: u64 = 0;
    loop {
      let incoming = tokio::select! {
        _ = &mut shutdown => break,
        accepted = self.listener.accept() => accepted,
      };
      let incoming = match incoming {
        Ok(incoming) => incoming,
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
          if backoff(shutdown.as_mut(), ACCEPT_BACKOFF).await {
            break;
          }
          continue;
        }
      };

      let id = next_id;
      next_id += 1;
      let relay = self.relay.clone();
      tokio::spawn(async move {
        match relay.handle(id, incoming).await {
          Ok(report) => tracing::debug!(
            session = id,
            "server->client: {}, client->server: {}",
            report.server_to_client,
            report.client_to_server
          ),
          Err(e) => tracing::debug!(session = id, "session aborted: {}", e),
        }
      });
    }

    drop(self.listener);
    tracing::info!("listener closed");
    Ok(())
  }

  /// Run the proxy server until the process receives an interrupt.
  pub async fn run(self) -> Result<()> {
    self
      .run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
          tracing::error!("failed to listen for interrupt: {}", e);
          std::future::pending::<()>().await;
        }
      })
      .await
  }
}

/// Wait out `delay`; returns `true` if `shutdown` resolved first.
async fn backoff<F>(shutdown: Pin<&mut F>, delay: Duration) -> bool
where
  F: Future<Output = ()>,
{
  tokio::select! {
    _ = shutdown => true,
    _ = tokio::time::sleep(delay) => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Instant;

  #[tokio::test]
  async fn test_backoff_yields_to_shutdown() {
    let shutdown = std::future::ready(());
    tokio::pin!(shutdown);
    let started = Instant::now();
    assert!(backoff(shutdown.as_mut(), Duration::from_secs(30)).await);
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn test_backoff_waits_without_shutdown() {
    let shutdown = std::future::pending::<()>();
    tokio::pin!(shutdown);
    assert!(!backoff(shutdown.as_mut(), Duration::from_millis(10)).await);
  }
}
