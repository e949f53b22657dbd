//! Local port tunnel through a chain.
//!
//! Every accepted connection gets its own chain, built from scratch, and
//! its own pair of copy tasks. Nothing is shared between connections
//! except the listening socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{Either, select};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::chain::ChainBuilder;
use crate::endpoint::{Endpoint, NetworkEndpoint};
use crate::error::{Error, Result};

pub struct Tunnel {
    listener: TcpListener,
    target: NetworkEndpoint,
    hops: Arc<Vec<Endpoint>>,
    builder: Arc<ChainBuilder>,
    drain_timeout: Option<Duration>,
}

impl Tunnel {
    /// Bind `localhost:<local_port>`. The chain is not dialed until a
    /// client connects.
    pub async fn bind(
        local_port: u16,
        target: NetworkEndpoint,
        hops: Vec<Endpoint>,
        builder: Arc<ChainBuilder>,
    ) -> Result<Self> {
        if hops.is_empty() {
            return Err(Error::EmptyChain);
        }

        let address = format!("localhost:{}", local_port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| Error::Listener { address, source })?;

        Ok(Self {
            listener,
            target,
            hops: Arc::new(hops),
            builder,
            drain_timeout: None,
        })
    }

    /// Bound how long the second copy direction may run once the first has
    /// ended. Without a bound both directions close on their own.
    pub fn with_drain_timeout(mut self, drain_timeout: Option<Duration>) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever. Only a failing accept ends the tunnel; failures of
    /// individual connections are logged and dropped.
    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        info!("Listening on {}, forwarding to {}", local, self.target.address());

        loop {
            let (stream, peer) = self.listener.accept().await.map_err(|source| Error::Listener {
                address: local.to_string(),
                source,
            })?;
            debug!("Accepted connection from {}", peer);

            let target = self.target.clone();
            let hops = self.hops.clone();
            let builder = self.builder.clone();
            let drain_timeout = self.drain_timeout;
            tokio::spawn(async move {
                if let Err(e) =
                    forward_connection(stream, &target, &hops, &builder, drain_timeout).await
                {
                    warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

/// Drive one accepted connection to completion.
///
/// Accepted -> chain building -> forwarding -> closed. A chain failure
/// drops the local connection and is returned to the caller.
pub async fn forward_connection(
    local: TcpStream,
    target: &NetworkEndpoint,
    hops: &[Endpoint],
    builder: &ChainBuilder,
    drain_timeout: Option<Duration>,
) -> Result<()> {
    let chain = builder.build(hops).await?;

    let channel = match chain.open_direct(&target.host, target.port).await {
        Ok(channel) => channel,
        Err(e) => {
            chain.close().await;
            return Err(e);
        }
    };
    debug!("Forwarding to {} over {} hop(s)", target.address(), chain.depth());

    let (sent, received) = splice(local, channel.into_stream(), drain_timeout).await;
    debug!(
        "Connection to {} closed ({} bytes sent, {} bytes received)",
        target.address(),
        sent,
        received
    );

    chain.close().await;
    Ok(())
}

/// Copy bytes both ways. Once one direction ends the other keeps running
/// until its own EOF or error, or until `drain_timeout` if one is set.
/// Returns the byte counts `(local -> remote, remote -> local)` that
/// completed.
async fn splice<S>(local: TcpStream, remote: S, drain_timeout: Option<Duration>) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        result
    });
    let downstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        result
    });

    let (first, mut other, first_is_upstream) = match select(upstream, downstream).await {
        Either::Left((done, other)) => (done, other, true),
        Either::Right((done, other)) => (done, other, false),
    };

    let drained = match drain_timeout {
        Some(limit) => tokio::time::timeout(limit, &mut other).await.ok(),
        None => Some((&mut other).await),
    };
    let second = match drained {
        Some(done) => done,
        None => {
            debug!("Drain timed out after {:?}", drain_timeout.unwrap_or_default());
            other.abort();
            return if first_is_upstream {
                (copied(first), 0)
            } else {
                (0, copied(first))
            };
        }
    };

    if first_is_upstream {
        (copied(first), copied(second))
    } else {
        (copied(second), copied(first))
    }
}

fn copied(
    result: std::result::Result<std::io::Result<u64>, tokio::task::JoinError>,
) -> u64 {
    match result {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Copy ended with error: {}", e);
            0
        }
        Err(e) => {
            debug!("Copy task ended abnormally: {}", e);
            0
        }
    }
}
