//! SSH Dialer: spec §4.6.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client::{self, Handle};
use russh::{kex, Preferred};
use thiserror::Error;
use tokio::time::timeout;

use crate::env::HostKeyPolicy;

use super::client::GatewayHandler;
use super::hostkeys::KnownHosts;

#[derive(Clone, Debug)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

#[derive(Clone)]
pub enum Credential {
    Password(String),
    PrivateKey { key_pem: String, passphrase: Option<String> },
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("ssh handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("ssh authentication failed")]
    AuthFailed,
    #[error("host key rejected")]
    HostKeyRejected,
    #[error("connection timed out")]
    Timeout,
}

pub struct DialerConfig {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: Arc<Mutex<KnownHosts>>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            keepalive_max: 3,
            host_key_policy: HostKeyPolicy::Tofu,
            known_hosts: Arc::new(Mutex::new(
                KnownHosts::load("").expect("default known_hosts path"),
            )),
        }
    }
}

pub type ClientHandle = Handle<GatewayHandler>;

/// `Dial(target, cred)`: returns a live, authenticated SSH client handle or
/// a classified error (spec §4.6).
pub async fn dial(target: &Target, credential: &Credential, cfg: &DialerConfig) -> Result<ClientHandle, DialError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(cfg.keepalive_interval),
        keepalive_max: cfg.keepalive_max,
        preferred: Preferred {
            kex: Cow::Owned(vec![kex::CURVE25519_PRE_RFC_8731, kex::EXTENSION_SUPPORT_AS_CLIENT]),
            ..Default::default()
        },
        ..<_>::default()
    });

    let rejected = Arc::new(AtomicBool::new(false));
    let handler = GatewayHandler {
        host: target.host.clone(),
        port: target.port,
        policy: cfg.host_key_policy,
        known_hosts: cfg.known_hosts.clone(),
        rejected: rejected.clone(),
    };

    let connect_fut = client::connect(config, (target.host.as_str(), target.port), handler);
    let mut handle = match timeout(cfg.connect_timeout, connect_fut).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            if rejected.load(Ordering::Acquire) {
                return Err(DialError::HostKeyRejected);
            }
            return Err(classify_connect_error(&e));
        }
        Err(_) => return Err(DialError::Timeout),
    };

    let auth_result = match credential {
        Credential::Password(password) => {
            handle
                .authenticate_password(target.user.clone(), password.clone())
                .await
        }
        Credential::PrivateKey { key_pem, passphrase } => {
            let key_pair = russh::keys::decode_secret_key(key_pem, passphrase.as_deref())
                .map_err(|e| DialError::HandshakeFailed(e.to_string()))?;
            handle
                .authenticate_publickey(
                    target.user.clone(),
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
                )
                .await
        }
    }
    .map_err(|e| DialError::HandshakeFailed(e.to_string()))?;

    if !auth_result.success() {
        return Err(DialError::AuthFailed);
    }

    Ok(handle)
}

fn classify_connect_error(e: &russh::Error) -> DialError {
    match e {
        russh::Error::IO(io) => {
            let message = io.to_string();
            if message.contains("lookup") || message.contains("resolve") || message.contains("name or service") {
                DialError::Dns(message)
            } else if io.kind() == std::io::ErrorKind::TimedOut {
                DialError::Timeout
            } else {
                DialError::Unreachable(message)
            }
        }
        other => DialError::HandshakeFailed(other.to_string()),
    }
}
