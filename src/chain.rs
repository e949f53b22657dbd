//! Chain builder: dials each endpoint through the session of the one
//! before it.
//!
//! ```text
//! local --TCP--> [hop 0] --direct-tcpip--> [hop 1] --direct-tcpip--> ... [hop N-1]
//! ```
//!
//! Every hop after the first runs its SSH handshake over a channel of the
//! previous hop's session, so the final session is nested N-1 deep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, Disconnect};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::SshSettings;
use crate::endpoint::{Credentials, Endpoint};
use crate::error::{Error, Result};
use crate::keys;

/// Per-hop client handler.
///
/// Host keys are not verified. The trust anchor is the freshly pushed
/// client key together with the control plane's authorization of the
/// instance; the presented key is only logged.
pub struct HopHandler {
    hop: usize,
    address: String,
}

impl client::Handler for HopHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "Hop {} ({}) presented host key {} (not verified)",
            self.hop,
            self.address,
            keys::fingerprint(server_public_key)
        );
        Ok(true)
    }
}

/// An established chain. Intermediate sessions are kept alive for as long
/// as the chain is, since every inner session rides on them.
pub struct ChainSession {
    hops: Vec<Handle<HopHandler>>,
}

impl ChainSession {
    /// Session on the final hop.
    pub fn handle(&self) -> &Handle<HopHandler> {
        // A chain is never empty; ChainBuilder::build rejects that.
        &self.hops[self.hops.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    /// Open a plain TCP connection from the final hop to `host:port`.
    pub async fn open_direct(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        self.handle()
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Forward {
                target: format!("{}:{}", host, port),
                reason: e.to_string(),
            })
    }

    /// Disconnect every hop, innermost first.
    pub async fn close(self) {
        for (hop, handle) in self.hops.iter().enumerate().rev() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("Hop {} disconnect: {}", hop, e);
            }
        }
    }
}

pub struct ChainBuilder {
    config: Arc<client::Config>,
    connect_timeout: Option<Duration>,
}

impl ChainBuilder {
    pub fn new(settings: &SshSettings) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: (settings.keepalive_secs > 0)
                .then(|| Duration::from_secs(settings.keepalive_secs)),
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            connect_timeout: settings.connect_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Dial `endpoints` in order. Any failure aborts the whole build and
    /// names the hop. Nothing is reused between builds: dialing the same
    /// endpoint twice pushes its key twice and opens two sessions.
    pub async fn build(&self, endpoints: &[Endpoint]) -> Result<ChainSession> {
        let (first, rest) = endpoints.split_first().ok_or(Error::EmptyChain)?;

        let mut hops = Vec::with_capacity(endpoints.len());
        hops.push(self.dial_direct(first).await?);

        for (index, endpoint) in rest.iter().enumerate() {
            let hop = index + 1;
            let previous = &hops[index];
            let handle = self.dial_nested(hop, previous, endpoint).await?;
            hops.push(handle);
        }

        info!("Connected through {} hop(s)", hops.len());
        Ok(ChainSession { hops })
    }

    async fn dial_direct(&self, endpoint: &Endpoint) -> Result<Handle<HopHandler>> {
        let credentials = endpoint.credentials()?;
        let address = endpoint.address()?;
        endpoint.ensure_accessible().await?;

        debug!("Hop 0: dialing {}", address);
        let stream = self
            .limit(TcpStream::connect(&address))
            .await
            .map_err(|reason| dial_error(0, &address, reason))?
            .map_err(|e| dial_error(0, &address, e.to_string()))?;

        self.handshake(0, address, stream, &credentials).await
    }

    async fn dial_nested(
        &self,
        hop: usize,
        previous: &Handle<HopHandler>,
        endpoint: &Endpoint,
    ) -> Result<Handle<HopHandler>> {
        let credentials = endpoint.credentials()?;
        let (host, port) = endpoint.dial_target()?;
        let address = endpoint.address()?;
        endpoint.ensure_accessible().await?;

        debug!("Hop {}: opening channel to {} through hop {}", hop, address, hop - 1);
        let channel = self
            .limit(previous.channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0))
            .await
            .map_err(|reason| dial_error(hop, &address, reason))?
            .map_err(|e| dial_error(hop, &address, e.to_string()))?;

        self.handshake(hop, address, channel.into_stream(), &credentials)
            .await
    }

    async fn handshake<S>(
        &self,
        hop: usize,
        address: String,
        stream: S,
        credentials: &Credentials,
    ) -> Result<Handle<HopHandler>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let handler = HopHandler {
            hop,
            address: address.clone(),
        };

        let mut handle = self
            .limit(client::connect_stream(self.config.clone(), stream, handler))
            .await
            .map_err(|reason| handshake_error(hop, &address, reason))?
            .map_err(|e| handshake_error(hop, &address, e.to_string()))?;

        let key = PrivateKeyWithHashAlg::new(credentials.key.clone(), None);
        let auth = self
            .limit(handle.authenticate_publickey(credentials.user.clone(), key))
            .await
            .map_err(|reason| handshake_error(hop, &address, reason))?
            .map_err(|e| handshake_error(hop, &address, e.to_string()))?;

        if !auth.success() {
            return Err(Error::AuthRejected {
                hop,
                address,
                user: credentials.user.clone(),
            });
        }

        debug!("Hop {}: authenticated to {} as {}", hop, address, credentials.user);
        Ok(handle)
    }

    /// Apply the optional connect timeout. Without one the future runs to
    /// completion.
    async fn limit<F: Future>(&self, fut: F) -> std::result::Result<F::Output, String> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| format!("timed out after {:?}", limit)),
            None => Ok(fut.await),
        }
    }
}

fn dial_error(hop: usize, address: &str, reason: String) -> Error {
    Error::Dial {
        hop,
        address: address.to_string(),
        reason,
    }
}

fn handshake_error(hop: usize, address: &str, reason: String) -> Error {
    Error::Handshake {
        hop,
        address: address.to_string(),
        reason,
    }
}
