//! Liveness probe: SSH key exchange plus authentication, then disconnect.

use std::sync::Arc;

use russh::client;
use russh::Disconnect;
use russh_keys::key;

use super::{ProbeError, SessionProbe, SESSION_TIMEOUT};
use crate::storage::{AuthMethod, DeviceCredentials};

/// Validated connection parameters derived from stored credentials.
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SessionAuth,
}

pub enum SessionAuth {
    Password(String),
    Key(Arc<key::KeyPair>),
}

impl SessionTarget {
    /// Check credentials before touching the network.
    pub fn from_credentials(creds: &DeviceCredentials) -> Result<Self, ProbeError> {
        let host = creds.host.trim();
        if host.is_empty() {
            return Err(ProbeError::Config("host is empty".to_string()));
        }
        let username = creds.username.trim();
        if username.is_empty() {
            return Err(ProbeError::Config("username is empty".to_string()));
        }

        let auth = match creds.auth() {
            AuthMethod::SshKey => {
                let pem = creds.private_key.trim();
                if pem.is_empty() {
                    return Err(ProbeError::Config("private key is empty".to_string()));
                }
                let passphrase = Some(creds.private_key_passphrase.as_str()).filter(|p| !p.is_empty());
                let pair = russh_keys::decode_secret_key(pem, passphrase)
                    .map_err(|e| ProbeError::Config(format!("invalid private key: {}", e)))?;
                SessionAuth::Key(Arc::new(pair))
            }
            AuthMethod::Password => {
                if creds.password.is_empty() {
                    return Err(ProbeError::Config("password is empty".to_string()));
                }
                SessionAuth::Password(creds.password.clone())
            }
        };

        Ok(Self {
            host: host.to_string(),
            port: creds.port_or_default(),
            username: username.to_string(),
            auth,
        })
    }
}

/// Host keys are not pinned: the check answers "can we log in", nothing more.
pub(super) struct AcceptAnyHostKey;

#[async_trait::async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshProbe {
    config: Arc<client::Config>,
}

impl Default for SshProbe {
    fn default() -> Self {
        Self {
            config: Arc::new(client::Config {
                inactivity_timeout: Some(SESSION_TIMEOUT),
                ..Default::default()
            }),
        }
    }
}

impl SshProbe {
    /// Connect and authenticate. The caller owns the disconnect.
    pub(super) async fn open(&self, target: &SessionTarget) -> Result<client::Handle<AcceptAnyHostKey>, ProbeError> {
        let mut session = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| ProbeError::Network(format!("{}:{}: {}", target.host, target.port, e)))?;

        let authenticated = match &target.auth {
            SessionAuth::Password(password) => {
                session
                    .authenticate_password(target.username.as_str(), password.as_str())
                    .await
            }
            SessionAuth::Key(pair) => {
                session
                    .authenticate_publickey(target.username.as_str(), pair.clone())
                    .await
            }
        }
        .map_err(|e| ProbeError::Auth(e.to_string()))?;

        if !authenticated {
            let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(ProbeError::Auth(format!("{} rejected by server", target.username)));
        }
        Ok(session)
    }
}

pub(super) async fn close(session: client::Handle<AcceptAnyHostKey>, host: &str) {
    if let Err(e) = session.disconnect(Disconnect::ByApplication, "", "en").await {
        tracing::debug!("SSH disconnect from {} failed: {}", host, e);
    }
}

#[async_trait::async_trait]
impl SessionProbe for SshProbe {
    async fn check(&self, credentials: &DeviceCredentials) -> Result<(), ProbeError> {
        let target = SessionTarget::from_credentials(credentials)?;
        let session = self.open(&target).await?;
        close(session, &target.host).await;
        Ok(())
    }
}
