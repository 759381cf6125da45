//! Caller authorization
//!
//! Every externally invoked operation receives a [`Context`] describing the
//! caller and an [`Authorizer`] chosen by the transport edge. The three
//! authorizer variants correspond to the three kinds of callers:
//!
//! - `Cluster`: Network and Application Servers inside the same deployment,
//!   proven by a shared cluster key;
//! - `Interop`: peer Network Servers and Application Servers speaking
//!   Backend-Interfaces, identified by a peer identity the edge attaches
//!   after TLS client authentication;
//! - `ApplicationRights`: users and API keys, whose bearer token is resolved
//!   to application rights by the identity service.
//!
//! The core only calls the predicates below and never inspects credentials
//! itself.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::identity::IdentityServer;
use crate::lorawan::{Eui64, NetId};

/// Identity of a Backend-Interfaces peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// NetID the peer is authenticated for.
    #[serde(default)]
    pub net_id: Option<NetId>,
    #[serde(default)]
    pub ns_id: Option<Eui64>,
    /// Application Server ID the peer is authenticated as.
    #[serde(default)]
    pub as_id: Option<String>,
    /// Host names presented in the peer's certificate.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Credentials attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    ClusterKey(String),
    Peer(PeerIdentity),
    Bearer(String),
}

/// Request context: the caller's credentials and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub credentials: Credentials,
    pub deadline: Option<Instant>,
}

impl Context {
    pub fn cluster(key: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::ClusterKey(key.into()),
            deadline: None,
        }
    }

    pub fn peer(identity: PeerIdentity) -> Self {
        Self {
            credentials: Credentials::Peer(identity),
            deadline: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::Bearer(token.into()),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn peer_identity(&self) -> Option<&PeerIdentity> {
        match &self.credentials {
            Credentials::Peer(p) => Some(p),
            _ => None,
        }
    }
}

/// Application rights understood by the Join Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Right {
    #[serde(rename = "RIGHT_APPLICATION_DEVICES_READ")]
    ApplicationDevicesRead,
    #[serde(rename = "RIGHT_APPLICATION_DEVICES_READ_KEYS")]
    ApplicationDevicesReadKeys,
    #[serde(rename = "RIGHT_APPLICATION_DEVICES_WRITE")]
    ApplicationDevicesWrite,
    #[serde(rename = "RIGHT_APPLICATION_DEVICES_WRITE_KEYS")]
    ApplicationDevicesWriteKeys,
    #[serde(rename = "RIGHT_APPLICATION_SETTINGS_BASIC")]
    ApplicationSettingsBasic,
}

impl Right {
    pub fn as_str(self) -> &'static str {
        match self {
            Right::ApplicationDevicesRead => "RIGHT_APPLICATION_DEVICES_READ",
            Right::ApplicationDevicesReadKeys => "RIGHT_APPLICATION_DEVICES_READ_KEYS",
            Right::ApplicationDevicesWrite => "RIGHT_APPLICATION_DEVICES_WRITE",
            Right::ApplicationDevicesWriteKeys => "RIGHT_APPLICATION_DEVICES_WRITE_KEYS",
            Right::ApplicationSettingsBasic => "RIGHT_APPLICATION_SETTINGS_BASIC",
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Right {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RIGHT_APPLICATION_DEVICES_READ" => Ok(Right::ApplicationDevicesRead),
            "RIGHT_APPLICATION_DEVICES_READ_KEYS" => Ok(Right::ApplicationDevicesReadKeys),
            "RIGHT_APPLICATION_DEVICES_WRITE" => Ok(Right::ApplicationDevicesWrite),
            "RIGHT_APPLICATION_DEVICES_WRITE_KEYS" => Ok(Right::ApplicationDevicesWriteKeys),
            "RIGHT_APPLICATION_SETTINGS_BASIC" => Ok(Right::ApplicationSettingsBasic),
            other => Err(Error::InvalidField("right".to_string(), other.to_string())),
        }
    }
}

/// Host part of a server address: scheme, port and path are stripped.
pub fn address_host(address: &str) -> &str {
    let rest = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    let rest = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = rest.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    rest.split(':').next().unwrap_or(rest)
}

/// How a caller is authorized.
#[derive(Clone)]
pub enum Authorizer {
    Cluster { keys: Arc<HashSet<String>> },
    Interop,
    ApplicationRights { identity: Arc<dyn IdentityServer> },
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorizer::Cluster { .. } => f.write_str("Authorizer::Cluster"),
            Authorizer::Interop => f.write_str("Authorizer::Interop"),
            Authorizer::ApplicationRights { .. } => f.write_str("Authorizer::ApplicationRights"),
        }
    }
}

impl Authorizer {
    pub fn cluster<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Authorizer::Cluster {
            keys: Arc::new(keys.into_iter().map(Into::into).collect()),
        }
    }

    pub fn application_rights(identity: Arc<dyn IdentityServer>) -> Self {
        Authorizer::ApplicationRights { identity }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Authorizer::Cluster { .. })
    }

    pub fn is_interop(&self) -> bool {
        matches!(self, Authorizer::Interop)
    }

    /// Basic gate every operation passes first. Bearer tokens must resolve
    /// in the identity service.
    pub async fn require_authorized(&self, ctx: &Context) -> Result<()> {
        match self {
            Authorizer::Cluster { keys } => match &ctx.credentials {
                Credentials::ClusterKey(key) if keys.contains(key) => Ok(()),
                Credentials::ClusterKey(_) => Err(Error::PermissionDenied(
                    "invalid cluster credentials".to_string(),
                )),
                _ => Err(Error::PermissionDenied(
                    "no cluster credentials".to_string(),
                )),
            },
            Authorizer::Interop => ctx.peer_identity().map(|_| ()).ok_or_else(|| {
                Error::PermissionDenied("no interop peer identity".to_string())
            }),
            Authorizer::ApplicationRights { identity } => match &ctx.credentials {
                Credentials::Bearer(token) if !token.is_empty() => {
                    identity.authenticate(token).await
                }
                _ => Err(Error::Unauthenticated("no bearer token".to_string())),
            },
        }
    }

    /// The interop peer must be authenticated for the host of `address`.
    pub fn require_address(&self, ctx: &Context, address: &str) -> Result<()> {
        let peer = self.interop_peer(ctx)?;
        let host = address_host(address);
        if peer
            .addresses
            .iter()
            .any(|a| address_host(a).eq_ignore_ascii_case(host))
        {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "peer is not authorized for address `{}`",
                host
            )))
        }
    }

    /// The interop peer must be authenticated for `net_id`.
    pub fn require_net_id(&self, ctx: &Context, net_id: NetId) -> Result<()> {
        let peer = self.interop_peer(ctx)?;
        if peer.net_id == Some(net_id) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "peer is not authorized for NetID `{}`",
                net_id
            )))
        }
    }

    /// The interop peer must be the Application Server `as_id`.
    pub fn require_as_id(&self, ctx: &Context, as_id: &str) -> Result<()> {
        let peer = self.interop_peer(ctx)?;
        if peer.as_id.as_deref() == Some(as_id) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "peer is not Application Server `{}`",
                as_id
            )))
        }
    }

    /// The bearer token must hold every right in `rights` on the
    /// application.
    pub async fn require_application(
        &self,
        ctx: &Context,
        application_id: &str,
        rights: &[Right],
    ) -> Result<()> {
        let identity = match self {
            Authorizer::ApplicationRights { identity } => identity,
            _ => {
                return Err(Error::PermissionDenied(
                    "caller has no application rights".to_string(),
                ))
            }
        };
        let token = match &ctx.credentials {
            Credentials::Bearer(token) if !token.is_empty() => token,
            _ => return Err(Error::Unauthenticated("no bearer token".to_string())),
        };
        let held = identity.application_rights(token, application_id).await?;
        match rights.iter().find(|r| !held.contains(r)) {
            None => Ok(()),
            Some(missing) => Err(Error::PermissionDenied(format!(
                "missing right {} on application `{}`",
                missing, application_id
            ))),
        }
    }

    fn interop_peer<'a>(&self, ctx: &'a Context) -> Result<&'a PeerIdentity> {
        if !self.is_interop() {
            return Err(Error::PermissionDenied(
                "caller is not an interop peer".to_string(),
            ));
        }
        ctx.peer_identity()
            .ok_or_else(|| Error::PermissionDenied("no interop peer identity".to_string()))
    }
}
