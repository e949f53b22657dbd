//! Test doubles: an in-process SSH server, an echo server, a fake
//! inventory and recording key pushers.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, NetworkEndpoint};
use crate::error::{Error, Result};
use crate::inventory::{InstanceRecord, Inventory, KeyPusher, PushOutcome, Reservation, TagFilter};

pub fn instance_record(id: &str, public: &str, private: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: id.to_string(),
        public_address: Some(public.to_string()),
        private_address: Some(private.to_string()),
        availability_zone: "eu-west-1a".to_string(),
    }
}

#[derive(Default)]
pub struct FakeInventory {
    instances: Vec<InstanceRecord>,
    reservations: Vec<Reservation>,
    capacity_requests: Vec<String>,
    pub id_lookups: AtomicUsize,
    pub tag_lookups: AtomicUsize,
}

impl FakeInventory {
    pub fn with_instance(mut self, record: InstanceRecord) -> Self {
        self.instances.push(record);
        self
    }

    pub fn with_reservation(mut self, instances: Vec<InstanceRecord>) -> Self {
        self.reservations.push(Reservation { instances });
        self
    }

    pub fn with_capacity_requests<'a>(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.capacity_requests
            .extend(ids.into_iter().map(String::from));
        self
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn find_instance_by_id(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.id_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned())
    }

    async fn find_instances_by_tag(&self, _tag: &TagFilter, _state: &str) -> Result<Vec<Reservation>> {
        self.tag_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.reservations.clone())
    }

    async fn find_capacity_requests_by_tag(
        &self,
        _tag: &TagFilter,
        _state: &str,
        _status: &str,
    ) -> Result<Vec<String>> {
        self.tag_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.capacity_requests.clone())
    }
}

enum PushMode {
    Accept,
    Throttle,
    Reject(String),
}

/// Records every push as `(instance id, os user, public key)`.
pub struct RecordingPusher {
    mode: PushMode,
    pub pushes: AtomicUsize,
    keys: Mutex<Vec<(String, String, String)>>,
}

impl RecordingPusher {
    fn with_mode(mode: PushMode) -> Self {
        Self {
            mode,
            pushes: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::with_mode(PushMode::Accept)
    }

    pub fn throttled() -> Self {
        Self::with_mode(PushMode::Throttle)
    }

    pub fn rejecting(request_id: &str) -> Self {
        Self::with_mode(PushMode::Reject(request_id.to_string()))
    }

    pub fn pushed_keys(&self) -> Vec<(String, String, String)> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyPusher for RecordingPusher {
    async fn push_public_key(
        &self,
        instance: &InstanceRecord,
        os_user: &str,
        public_key: &str,
    ) -> Result<PushOutcome> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push((
            instance.instance_id.clone(),
            os_user.to_string(),
            public_key.to_string(),
        ));
        match &self.mode {
            PushMode::Accept => Ok(PushOutcome::Accepted),
            PushMode::Throttle => Ok(PushOutcome::Throttled),
            PushMode::Reject(request_id) => Err(Error::KeyPushRejected {
                instance: instance.instance_id.clone(),
                request_id: request_id.clone(),
            }),
        }
    }
}

/// Counters shared by every connection to one [`TestSshServer`].
#[derive(Default)]
pub struct ServerStats {
    pub authentications: AtomicUsize,
    pub direct_tcpip: AtomicUsize,
}

impl ServerStats {
    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }

    pub fn direct_tcpip(&self) -> usize {
        self.direct_tcpip.load(Ordering::SeqCst)
    }
}

/// SSH server on loopback that accepts any public key (or, when started
/// with `start_rejecting`, refuses every one), relays
/// direct-tcpip channels to the requested address and runs a toy echo
/// shell on session channels.
pub struct TestSshServer {
    pub addr: SocketAddr,
    pub stats: Arc<ServerStats>,
    task: JoinHandle<()>,
}

impl TestSshServer {
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// A server that refuses every public key.
    pub async fn start_rejecting() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(accept_keys: bool) -> Self {
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .expect("generate host key");
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("test server address");
        let stats = Arc::new(ServerStats::default());

        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let handler = TestHandler {
                    stats: task_stats.clone(),
                    accept_keys,
                    shells: HashSet::new(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(e) = session.await {
                                debug!("Test SSH session ended: {}", e);
                            }
                        }
                        Err(e) => warn!("Test SSH connection error: {}", e),
                    }
                });
            }
        });

        Self { addr, stats, task }
    }

    /// A network endpoint pointing at this server.
    pub fn endpoint(&self, key: Arc<russh::keys::PrivateKey>) -> Endpoint {
        Endpoint::Network(
            NetworkEndpoint::new("127.0.0.1", self.addr.port())
                .with_user("tester")
                .with_key(key),
        )
    }
}

impl Drop for TestSshServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TestHandler {
    stats: Arc<ServerStats>,
    accept_keys: bool,
    // Data and EOF also reach the handler for direct-tcpip channels.
    shells: HashSet<ChannelId>,
}

impl Handler for TestHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        self.stats.authentications.fetch_add(1, Ordering::SeqCst);
        if !self.accept_keys {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    /// Shell that greets on stderr, echoes stdin and exits with status 3
    /// once the client sends EOF.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel_id)?;
        self.shells.insert(channel_id);
        let _ = session
            .handle()
            .extended_data(channel_id, 1, CryptoVec::from_slice(b"motd\n"))
            .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.shells.contains(&channel_id) {
            return Ok(());
        }
        let _ = session
            .handle()
            .data(channel_id, CryptoVec::from_slice(data))
            .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.shells.remove(&channel_id) {
            return Ok(());
        }
        let handle = session.handle();
        let _ = handle.exit_status_request(channel_id, 3).await;
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        self.stats.direct_tcpip.fetch_add(1, Ordering::SeqCst);

        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let mut upstream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Test server cannot reach {}: {}", target, e);
                return Ok(false);
            }
        };

        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            let _ = stream.shutdown().await;
        });
        Ok(true)
    }
}

/// TCP server that echoes every byte back until the client half-closes.
pub async fn start_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo server");
    let addr = listener.local_addr().expect("echo server address");
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    (addr, task)
}

/// TCP server that accepts and immediately hangs up, so a dial succeeds
/// but any handshake on top of it fails.
pub async fn start_hangup_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind hangup server");
    let addr = listener.local_addr().expect("hangup server address");
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    (addr, task)
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind scratch listener");
    listener.local_addr().expect("scratch listener address").port()
}
