//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::info;

use super::session::SshSession;
use crate::AppState;

/// Top-level SSH server that hands each incoming connection to an
/// [`SshSession`] handler.
pub struct CodedropServer {
    state: Arc<AppState>,
}

impl CodedropServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for CodedropServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new ssh client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

/// Load the PEM-encoded host key from the configured path.
async fn load_host_key(path: &str) -> Result<KeyPair> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read ssh host key from {path:?}"))?;
    russh_keys::decode_secret_key(&pem, None)
        .with_context(|| format!("failed to decode ssh host key from {path:?}"))
}

/// Start the SSH listener. Runs until the server is shut down or an
/// unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let host_key = load_host_key(&state.config.host_key_path).await?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        // Any client is accepted; the handler admits both "none" and
        // publickey attempts.
        methods: MethodSet::NONE | MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });

    let port = state.config.ssh_port;
    info!(port, "starting ssh server");

    let mut server = CodedropServer::new(state);
    server
        .run_on_address(config, ("0.0.0.0", port))
        .await
        .context("ssh server exited with error")?;

    Ok(())
}
