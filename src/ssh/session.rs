//! Per-connection SSH session handler implementing the `russh` [`Handler`]
//! trait, plus the command grammar and the two ingestion flows.
//!
//! Each session channel gets a small pipe: the `data` callbacks feed client
//! stdin into an mpsc sender, and a spawned driver task owns the receiving
//! end together with a [`Handle`] for writing banners back. EOF is signalled
//! by dropping the sender. The driver either accumulates a snippet and
//! writes it to the store, or parks a tunnel in the registry and blocks
//! until the HTTP consumer (or the reaper) finishes it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::keygen;
use crate::store::CODE_UPLOADED_COUNT_KEY;
use crate::tunnel::TunnelData;
use crate::AppState;

/// Snippet uploads are truncated at this size.
pub const MAX_UPLOAD_SIZE: usize = 1024 * 1024;

/// Client-requested snippet TTLs are clamped into this range.
pub const MIN_TTL: Duration = Duration::from_secs(60);
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL used when the client does not ask for one.
pub const DEFAULT_TTL: Duration = MAX_TTL;

/// Depth of the per-channel stdin pipe. A full pipe backpressures the
/// session transport instead of buffering without bound.
const STDIN_PIPE_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// Command grammar
// ---------------------------------------------------------------------------

/// What a session asked for, after parsing its exec tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    Basic { ttl: Duration },
    Tunnel,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("invalid boolean for tunnel: {0:?}")]
    InvalidTunnelValue(String),
    #[error("invalid integer for ttl: {0:?}")]
    InvalidTtlValue(String),
}

fn clamp_ttl(secs: i64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TTL.as_secs() as i64, MAX_TTL.as_secs() as i64) as u64)
}

/// Resolve what a session asked for.
///
/// An absent or blank exec command is a plain upload with the default TTL;
/// anything else goes through command mode.
pub(crate) fn resolve_session_mode(
    command: Option<&str>,
) -> Result<Option<SessionMode>, CommandError> {
    match command {
        None => Ok(Some(SessionMode::Basic { ttl: DEFAULT_TTL })),
        Some(raw) if raw.trim().is_empty() => Ok(Some(SessionMode::Basic { ttl: DEFAULT_TTL })),
        Some(raw) => parse_session_command(raw),
    }
}

/// Parse whitespace-separated `key=value` tokens.
///
/// `tunnel=true` wins over any `ttl` token; the last `ttl` token wins over
/// earlier ones. Unknown keys are logged and ignored; a command made only of
/// unknown tokens asks for no work at all (`Ok(None)`). A recognized key
/// with an unparseable value is a protocol error.
pub(crate) fn parse_session_command(raw: &str) -> Result<Option<SessionMode>, CommandError> {
    let mut tunnel = false;
    let mut ttl = None;
    let mut recognized = false;

    for token in raw.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            warn!(token, "malformed command token");
            continue;
        };
        match key {
            "tunnel" => {
                tunnel = value
                    .parse::<bool>()
                    .map_err(|_| CommandError::InvalidTunnelValue(value.to_string()))?;
                recognized = true;
            }
            "ttl" => {
                let secs = value
                    .parse::<i64>()
                    .map_err(|_| CommandError::InvalidTtlValue(value.to_string()))?;
                ttl = Some(clamp_ttl(secs));
                recognized = true;
            }
            _ => warn!(key, "unknown command key"),
        }
    }

    if tunnel {
        return Ok(Some(SessionMode::Tunnel));
    }
    if let Some(ttl) = ttl {
        return Ok(Some(SessionMode::Basic { ttl }));
    }
    if recognized {
        // tunnel=false with no ttl override.
        return Ok(Some(SessionMode::Basic { ttl: DEFAULT_TTL }));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Banners
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[32m";
const GRAY: &str = "\x1b[37m";
const PURPLE: &str = "\x1b[35m";

fn banner_header() -> String {
    format!(
        "{GRAY}+------------------------+\n\
         |    \u{1f4bb} codedrop \u{1f4bb}    |\n\
         +------------------------+{RESET}\n\n"
    )
}

fn upload_banner(host: &str, key: &str) -> String {
    let mut output = banner_header();
    output += &format!("{GREEN}Your code has been successfully uploaded! \u{1f680}{RESET}\n\n");
    output += &format!("Link: {PURPLE}{host}/c/{key}{RESET}\n\n");
    output += &format!("{GREEN}+------------------------+\n");
    output
}

fn tunnel_banner(host: &str, key: &str) -> String {
    let mut output = banner_header();
    output += &format!(
        "{GREEN}You opened a tunnel. Your code is ready to be streamed! \u{1f680}{RESET}\n\n"
    );
    output += &format!("Link: {PURPLE}{host}/t/{key}{RESET}\n\n");
    output
}

fn transfer_complete_banner() -> String {
    format!("{GREEN}Code transferred successfully! {RESET}\n\n")
}

fn rate_limited_banner() -> String {
    format!("{GREEN}You have been rate limited. Please try again later.{RESET}\n\n")
}

// ---------------------------------------------------------------------------
// Session handler
// ---------------------------------------------------------------------------

struct ChannelPipe {
    stdin_tx: Option<mpsc::Sender<Bytes>>,
    stdin_rx: Option<mpsc::Receiver<Bytes>>,
    dispatched: bool,
}

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    channels: HashMap<ChannelId, ChannelPipe>,
}

impl SshSession {
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            channels: HashMap::new(),
        }
    }

    /// Admit the session, resolve its mode, and hand the channel's stdin to
    /// a spawned driver. `command` is `None` for plain shell sessions.
    async fn dispatch(
        &mut self,
        channel: ChannelId,
        command: Option<&str>,
        session: &mut Session,
    ) -> Result<()> {
        match self.channels.get_mut(&channel) {
            Some(pipe) if !pipe.dispatched => pipe.dispatched = true,
            _ => return Ok(()),
        }

        let Some(ip) = self.peer_addr.map(|addr| addr.ip().to_string()) else {
            warn!("ssh session without a peer address");
            session.close(channel);
            return Ok(());
        };

        match self.state.limiter.is_rate_limited(&ip).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(%ip, "rate limited ssh session");
                session.data(channel, CryptoVec::from_slice(rate_limited_banner().as_bytes()));
                session.close(channel);
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, %ip, "admission check failed");
                session.close(channel);
                return Ok(());
            }
        }

        let mode = match resolve_session_mode(command) {
            Ok(mode) => mode,
            Err(err) => {
                error!(error = %err, "failed to parse session command");
                session.close(channel);
                return Ok(());
            }
        };

        let Some(mode) = mode else {
            // Only unknown tokens: no work to do.
            session.close(channel);
            return Ok(());
        };

        let Some(rx) = self
            .channels
            .get_mut(&channel)
            .and_then(|pipe| pipe.stdin_rx.take())
        else {
            session.close(channel);
            return Ok(());
        };

        let state = Arc::clone(&self.state);
        let handle = session.handle();
        tokio::spawn(drive_session(state, handle, channel, rx, mode));

        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Any client may connect; there is no allow-list.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = ?self.peer_addr, %user, "ssh auth (none)");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        debug!(peer = ?self.peer_addr, %user, "ssh auth (publickey)");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = mpsc::channel(STDIN_PIPE_DEPTH);
        self.channels.insert(
            channel.id(),
            ChannelPipe {
                stdin_tx: Some(tx),
                stdin_rx: Some(rx),
                dispatched: false,
            },
        );
        Ok(true)
    }

    /// Interactive clients allocate a pty before their shell; accept and
    /// ignore it.
    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// A shell session with no command performs a basic ingest.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, None, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        info!(peer = ?self.peer_addr, command = %raw, "ssh exec request");
        self.dispatch(channel, Some(&raw), session).await
    }

    /// Client stdin. Forwarded into the channel's pipe; a closed pipe means
    /// the driver stopped reading and further input is discarded.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pipe) = self.channels.get_mut(&channel) {
            if let Some(tx) = pipe.stdin_tx.clone() {
                if tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                    pipe.stdin_tx = None;
                }
            }
        }
        Ok(())
    }

    /// Client EOF: drop the sender so the driver sees end of stream.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pipe) = self.channels.get_mut(&channel) {
            pipe.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session drivers
// ---------------------------------------------------------------------------

/// Run the chosen mode to completion, then close the channel. Close errors
/// are reported, never escalated.
async fn drive_session(
    state: Arc<AppState>,
    handle: Handle,
    channel: ChannelId,
    rx: mpsc::Receiver<Bytes>,
    mode: SessionMode,
) {
    match mode {
        SessionMode::Basic { ttl } => ingest_snippet(&state, &handle, channel, rx, ttl).await,
        SessionMode::Tunnel => open_tunnel(&state, &handle, channel, rx).await,
    }

    let _ = handle.eof(channel).await;
    if handle.close(channel).await.is_err() {
        debug!("failed to close ssh channel");
    }
}

/// Accumulate stdin up to [`MAX_UPLOAD_SIZE`]; anything past the bound is
/// truncated.
async fn read_snippet(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut body = Vec::new();
    while body.len() < MAX_UPLOAD_SIZE {
        let Some(chunk) = rx.recv().await else { break };
        let room = MAX_UPLOAD_SIZE - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    body
}

async fn ingest_snippet(
    state: &AppState,
    handle: &Handle,
    channel: ChannelId,
    mut rx: mpsc::Receiver<Bytes>,
    ttl: Duration,
) {
    let body = read_snippet(&mut rx).await;

    let key = keygen::mint_key();
    debug!(%key, bytes = body.len(), ttl_secs = ttl.as_secs(), "writing snippet to store");

    if let Err(err) = state.store.set(&key, &body, Some(ttl)).await {
        error!(error = %err, %key, "failed to write snippet to store");
        return;
    }

    if let Err(err) = state.store.incr(CODE_UPLOADED_COUNT_KEY).await {
        warn!(error = %err, "failed to bump the upload counter");
    }

    write_banner(handle, channel, upload_banner(&state.config.host, &key)).await;
}

async fn open_tunnel(
    state: &AppState,
    handle: &Handle,
    channel: ChannelId,
    rx: mpsc::Receiver<Bytes>,
) {
    let key = keygen::mint_key();
    debug!(%key, "creating tunnel");

    let tunnel = Arc::new(TunnelData::new(rx));
    state.tunnels.add(key.clone(), Arc::clone(&tunnel));

    // The client must see the URL before any consumer can arrive.
    if !write_banner(handle, channel, tunnel_banner(&state.config.host, &key)).await {
        return;
    }

    tunnel.wait().await;
    state.tunnels.remove(&key);
    debug!(%key, "transfer over tunnel complete");

    write_banner(handle, channel, transfer_complete_banner()).await;
}

async fn write_banner(handle: &Handle, channel: ChannelId, banner: String) -> bool {
    if handle
        .data(channel, CryptoVec::from_slice(banner.as_bytes()))
        .await
        .is_err()
    {
        warn!("failed to write to ssh session");
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_a_basic_session_with_default_ttl() {
        let basic = Some(SessionMode::Basic { ttl: DEFAULT_TTL });
        assert_eq!(resolve_session_mode(None).unwrap(), basic);
        assert_eq!(resolve_session_mode(Some("")).unwrap(), basic);
        assert_eq!(resolve_session_mode(Some("   ")).unwrap(), basic);
    }

    #[test]
    fn unknown_only_commands_ask_for_no_work() {
        assert_eq!(parse_session_command("color=blue").unwrap(), None);
        assert_eq!(parse_session_command("justaword").unwrap(), None);
        assert_eq!(resolve_session_mode(Some("color=blue")).unwrap(), None);
    }

    #[test]
    fn tunnel_true_opens_a_tunnel() {
        assert_eq!(
            parse_session_command("tunnel=true").unwrap(),
            Some(SessionMode::Tunnel)
        );
    }

    #[test]
    fn tunnel_false_is_a_basic_session_with_default_ttl() {
        assert_eq!(
            parse_session_command("tunnel=false").unwrap(),
            Some(SessionMode::Basic { ttl: DEFAULT_TTL })
        );
    }

    #[test]
    fn tunnel_wins_over_ttl() {
        assert_eq!(
            parse_session_command("tunnel=true ttl=120").unwrap(),
            Some(SessionMode::Tunnel)
        );
        assert_eq!(
            parse_session_command("ttl=120 tunnel=true").unwrap(),
            Some(SessionMode::Tunnel)
        );
    }

    #[test]
    fn ttl_is_clamped_into_range() {
        assert_eq!(
            parse_session_command("ttl=0").unwrap(),
            Some(SessionMode::Basic { ttl: MIN_TTL })
        );
        assert_eq!(
            parse_session_command("ttl=-5").unwrap(),
            Some(SessionMode::Basic { ttl: MIN_TTL })
        );
        assert_eq!(
            parse_session_command("ttl=999999").unwrap(),
            Some(SessionMode::Basic { ttl: MAX_TTL })
        );
        assert_eq!(
            parse_session_command("ttl=120").unwrap(),
            Some(SessionMode::Basic {
                ttl: Duration::from_secs(120)
            })
        );
    }

    #[test]
    fn last_ttl_token_wins() {
        assert_eq!(
            parse_session_command("ttl=120 ttl=300").unwrap(),
            Some(SessionMode::Basic {
                ttl: Duration::from_secs(300)
            })
        );
    }

    #[test]
    fn invalid_values_are_protocol_errors() {
        assert!(matches!(
            parse_session_command("tunnel=yes"),
            Err(CommandError::InvalidTunnelValue(_))
        ));
        assert!(matches!(
            parse_session_command("ttl=soon"),
            Err(CommandError::InvalidTtlValue(_))
        ));
    }

    #[tokio::test]
    async fn read_snippet_stops_at_eof() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        assert_eq!(read_snippet(&mut rx).await, b"hello world");
    }

    #[tokio::test]
    async fn read_snippet_truncates_at_the_upload_bound() {
        let (tx, mut rx) = mpsc::channel(8);
        let chunk = Bytes::from(vec![b'x'; 512 * 1024]);
        // 2 MiB + 1 byte in total.
        for _ in 0..4 {
            tx.send(chunk.clone()).await.unwrap();
        }
        tx.send(Bytes::from_static(b"y")).await.unwrap();
        drop(tx);

        let body = read_snippet(&mut rx).await;
        assert_eq!(body.len(), MAX_UPLOAD_SIZE);
        assert!(body.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn banners_carry_the_links() {
        let upload = upload_banner("https://codedrop.sh", "abc1234");
        assert!(upload.contains("https://codedrop.sh/c/abc1234"));
        assert!(upload.contains("successfully uploaded"));

        let tunnel = tunnel_banner("https://codedrop.sh", "abc1234");
        assert!(tunnel.contains("https://codedrop.sh/t/abc1234"));
        assert!(tunnel.contains("opened a tunnel"));

        assert!(transfer_complete_banner().contains("Code transferred successfully!"));
        assert!(rate_limited_banner().contains("rate limited"));
    }
}
