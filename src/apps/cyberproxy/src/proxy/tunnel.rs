use super::{ProxyError, ProxyResult};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction over the life of a tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// An opaque byte relay between a CONNECT client and the terminator.
///
/// Each direction runs as its own task. Both share one cancellation token:
/// whichever direction finishes first (EOF, error, or server shutdown)
/// cancels it, the other direction stops at its next await point, and both
/// write halves are shut down before the sockets are dropped.
pub struct TunnelSession<C, U> {
    target: String,
    client: C,
    upstream: U,
}

impl<C, U> TunnelSession<C, U>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(target: impl Into<String>, client: C, upstream: U) -> Self {
        Self {
            target: target.into(),
            client,
            upstream,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> ProxyResult<TunnelStats> {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (upstream_read, upstream_write) = tokio::io::split(self.upstream);

        let outbound = tokio::spawn(relay(client_read, upstream_write, cancel.clone()));
        let inbound = tokio::spawn(relay(upstream_read, client_write, cancel.clone()));
        let (outbound, inbound) = tokio::join!(outbound, inbound);

        let outbound = outbound.map_err(|e| ProxyError::Tunnel(e.to_string()))?;
        let inbound = inbound.map_err(|e| ProxyError::Tunnel(e.to_string()))?;

        let stats = TunnelStats {
            client_to_upstream: outbound.bytes,
            upstream_to_client: inbound.bytes,
        };
        debug!(
            "Tunnel to {} closed: {} bytes client->upstream, {} bytes upstream->client",
            self.target, stats.client_to_upstream, stats.upstream_to_client
        );

        match outbound.error.or(inbound.error) {
            Some(e) => Err(ProxyError::Io(e)),
            None => Ok(stats),
        }
    }
}

struct RelayOutcome {
    bytes: u64,
    error: Option<std::io::Error>,
}

async fn relay<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken) -> RelayOutcome
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break None,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break None,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            break Some(e);
        }
        bytes += n as u64;
    };

    cancel.cancel();
    let _ = writer.shutdown().await;
    RelayOutcome { bytes, error }
}
