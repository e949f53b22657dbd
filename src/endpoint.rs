//! Chain endpoints: literal network addresses and inventory-backed instances.

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::inventory::{InstanceRecord, Inventory, KeyPusher};
use crate::keys;

pub const DEFAULT_PORT: u16 = 22;

/// Default OS user on instance images.
pub const DEFAULT_USER: &str = "ec2-user";

/// A parsed `[user@]target[:port]` string.
///
/// Parsing never fails. A port that is missing, zero or not a number
/// leaves the port unset, and the text before the colon is still the host.
/// Bare IPv6 addresses (more than one colon) are taken whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub user: Option<String>,
    pub target: String,
    pub port: Option<u16>,
}

impl Selector {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) => ((!user.is_empty()).then(|| user.to_string()), rest),
            None => (None, s),
        };
        let (target, port) = split_port(rest);

        Self {
            user,
            target: target.to_string(),
            port,
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Whether the target names an instance (`i-` followed by hex digits).
    pub fn is_instance(&self) -> bool {
        self.target
            .strip_prefix("i-")
            .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

fn split_port(s: &str) -> (&str, Option<u16>) {
    // [v6-address]:port
    if let Some(inner) = s.strip_prefix('[') {
        if let Some((host, tail)) = inner.split_once(']') {
            let port = tail.strip_prefix(':').and_then(parse_port);
            return (host, port);
        }
        return (s, None);
    }

    // A bare IPv6 address has several colons and no port.
    if s.matches(':').count() != 1 {
        return (s, None);
    }

    match s.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)),
        None => (s, None),
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// User and key used to authenticate a hop.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub key: Arc<PrivateKey>,
}

/// A literal `host:port` endpoint.
#[derive(Clone)]
pub struct NetworkEndpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub private_key: Option<Arc<PrivateKey>>,
}

impl NetworkEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            private_key: None,
        }
    }

    pub fn from_selector(selector: &Selector) -> Self {
        Self {
            host: selector.target.clone(),
            port: selector.port_or_default(),
            user: selector.user.clone(),
            private_key: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_key(mut self, key: Arc<PrivateKey>) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn address(&self) -> String {
        format_address(&self.host, self.port)
    }

    pub fn credentials(&self) -> Result<Credentials> {
        let user = self.user.clone().ok_or_else(|| Error::MissingKey(self.address()))?;
        let key = self
            .private_key
            .clone()
            .ok_or_else(|| Error::MissingKey(self.address()))?;
        Ok(Credentials { user, key })
    }
}

impl fmt::Debug for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|k| keys::fingerprint(k.public_key())),
            )
            .finish()
    }
}

/// An endpoint backed by an inventory instance, reached with an ephemeral
/// key that is pushed to the instance right before each dial.
#[derive(Clone)]
pub struct InstanceEndpoint {
    port: u16,
    user: String,
    private_key: Arc<PrivateKey>,
    public_key: String,
    use_private: bool,
    instance: InstanceRecord,
    pusher: Arc<dyn KeyPusher>,
}

impl InstanceEndpoint {
    /// Look the instance up once and generate its keypair once.
    pub async fn resolve(
        selector: &Selector,
        default_user: &str,
        use_private: bool,
        inventory: &dyn Inventory,
        pusher: Arc<dyn KeyPusher>,
    ) -> Result<Self> {
        let instance = inventory
            .find_instance_by_id(&selector.target)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(selector.target.clone()))?;
        let (private_key, public_key) = keys::generate_keypair()?;

        info!(
            "Resolved {} in {} (public: {}, private: {})",
            instance.instance_id,
            instance.availability_zone,
            instance.public_address.as_deref().unwrap_or("-"),
            instance.private_address.as_deref().unwrap_or("-"),
        );

        Ok(Self {
            port: selector.port_or_default(),
            user: selector
                .user
                .clone()
                .unwrap_or_else(|| default_user.to_string()),
            private_key: Arc::new(private_key),
            public_key,
            use_private,
            instance,
            pusher,
        })
    }

    pub fn dial_target(&self) -> Result<(String, u16)> {
        let (address, kind) = if self.use_private {
            (&self.instance.private_address, "private")
        } else {
            (&self.instance.public_address, "public")
        };
        let host = address.clone().ok_or_else(|| Error::NoAddress {
            instance: self.instance.instance_id.clone(),
            kind,
        })?;
        Ok((host, self.port))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            key: self.private_key.clone(),
        }
    }

    pub async fn ensure_accessible(&self) -> Result<()> {
        keys::push_key(
            self.pusher.as_ref(),
            &self.instance,
            &self.user,
            &self.public_key,
        )
        .await
    }
}

impl fmt::Debug for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceEndpoint")
            .field("instance", &self.instance)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("use_private", &self.use_private)
            .field("key", &keys::fingerprint(self.private_key.public_key()))
            .finish()
    }
}

/// One hop of a chain.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Network(NetworkEndpoint),
    Instance(InstanceEndpoint),
}

impl Endpoint {
    /// Host and port to dial. Pure: never touches the network.
    pub fn dial_target(&self) -> Result<(String, u16)> {
        match self {
            Endpoint::Network(ep) => Ok((ep.host.clone(), ep.port)),
            Endpoint::Instance(ep) => ep.dial_target(),
        }
    }

    pub fn address(&self) -> Result<String> {
        let (host, port) = self.dial_target()?;
        Ok(format_address(&host, port))
    }

    pub fn credentials(&self) -> Result<Credentials> {
        match self {
            Endpoint::Network(ep) => ep.credentials(),
            Endpoint::Instance(ep) => Ok(ep.credentials()),
        }
    }

    /// Make the endpoint reachable with its credentials. For instances this
    /// pushes the public key; literal endpoints need nothing.
    pub async fn ensure_accessible(&self) -> Result<()> {
        match self {
            Endpoint::Network(_) => Ok(()),
            Endpoint::Instance(ep) => ep.ensure_accessible().await,
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Endpoint::Instance(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Network(ep) => match &ep.user {
                Some(user) => write!(f, "{}@{}", user, ep.address()),
                None => write!(f, "{}", ep.address()),
            },
            Endpoint::Instance(ep) => {
                write!(f, "{}@{}:{}", ep.user, ep.instance.instance_id, ep.port)
            }
        }
    }
}

/// Turns selectors into endpoints with shared collaborators.
#[derive(Clone)]
pub struct EndpointFactory {
    inventory: Arc<dyn Inventory>,
    pusher: Arc<dyn KeyPusher>,
    default_user: String,
    identity: Option<Arc<PrivateKey>>,
}

impl EndpointFactory {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        pusher: Arc<dyn KeyPusher>,
        default_user: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            pusher,
            default_user: default_user.into(),
            identity: None,
        }
    }

    /// Key used by literal network hops.
    pub fn with_identity(mut self, key: PrivateKey) -> Self {
        self.identity = Some(Arc::new(key));
        self
    }

    pub async fn endpoint(&self, selector: &Selector, use_private: bool) -> Result<Endpoint> {
        if selector.is_instance() {
            let ep = InstanceEndpoint::resolve(
                selector,
                &self.default_user,
                use_private,
                self.inventory.as_ref(),
                self.pusher.clone(),
            )
            .await?;
            return Ok(Endpoint::Instance(ep));
        }

        let mut ep = NetworkEndpoint::from_selector(selector);
        if ep.user.is_none() {
            ep.user = Some(self.default_user.clone());
        }
        ep.private_key = self.identity.clone();
        Ok(Endpoint::Network(ep))
    }

    /// Build a chain. Only the first hop is reached over its public
    /// address; every later hop stays on the private network.
    pub async fn chain(&self, selectors: &[Selector]) -> Result<Vec<Endpoint>> {
        if selectors.is_empty() {
            return Err(Error::EmptyChain);
        }

        let mut endpoints = Vec::with_capacity(selectors.len());
        for (hop, selector) in selectors.iter().enumerate() {
            let endpoint = self.endpoint(selector, hop > 0).await?;
            debug!("Hop {}: {}", hop, endpoint);
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }
}
