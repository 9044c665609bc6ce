//! The per-client state machine coupling one client socket and up to
//! one server socket.
//!
//! One readiness event enters the loop; the loop keeps running while
//! states change synchronously and parks on the appropriate readiness
//! (with the phase's timeout) whenever an I/O step would block. Policy
//! hooks fire at the fixed points between network steps.

pub mod tracker;

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::backend::{Backend, BackendRegistry, BackendState};
use crate::error::{Error, Result};
use crate::net::{IoStatus, Socket};
use crate::policy::{Decision, HookContext, PolicyHook};
use crate::protocol::connect::AuthResponse;
use crate::protocol::packet;
use crate::protocol::response::{ErrPacket, OkPacket, ER_ACCESS_DENIED_ERROR, ER_UNKNOWN_ERROR};
use crate::protocol::{Capabilities, Command};

use tracker::CommandTracker;

/// Streamed results flush to the client once this many bytes are
/// queued, well before the response is complete.
const RESULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Servers in this version window answer a failed `COM_CHANGE_USER`
/// with two ERR packets (MySQL bug #25371).
const BUG_25371_WINDOW: std::ops::Range<u32> = 50114..50118;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    /// Serve new clients off pooled, already-authenticated server
    /// sockets when possible.
    pub pool_reuse: bool,

    /// Realign a pooled socket with `COM_CHANGE_USER`; when off, the
    /// client's identity must match the cached one byte for byte.
    pub pool_change_user: bool,

    /// Swallow the duplicate ERR of bug #25371 instead of refusing
    /// servers in the affected version window.
    pub fix_bug_25371: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            write_timeout: None,
            pool_reuse: false,
            pool_change_user: true,
            fix_bug_25371: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    ConnectServer,
    ReadHandshake,
    SendHandshake,
    ReadAuth,
    SendAuth,
    ReadAuthResult,
    SendAuthResult,
    ReadAuthOldPassword,
    SendAuthOldPassword,
    ReadQuery,
    SendQuery,
    ReadQueryResult,
    SendQueryResult,
    ReadLocalInfileData,
    SendLocalInfileData,
    ReadLocalInfileResult,
    SendLocalInfileResult,
    CloseClient,
    SendError,
    Error,
}

/// One proxied client connection.
pub struct Connection {
    state: State,

    client: Socket,
    server: Option<Socket>,
    backend: Option<Arc<Backend>>,

    registry: Arc<BackendRegistry>,
    policy: Arc<dyn PolicyHook>,
    options: ConnectionOptions,

    command: Option<Command>,
    tracker: Option<CommandTracker>,

    injection: VecDeque<Vec<u8>>,
    resultset_is_needed: bool,
    result_buffer: Vec<Bytes>,
    client_reply: Vec<Vec<u8>>,

    /// The client's current command continues in the next frame.
    is_overlong: bool,

    /// The server's current response packet continues in the next
    /// frame.
    result_overlong: bool,

    /// The response in flight is complete; `SEND_QUERY_RESULT` may hand
    /// the turn back to the client.
    result_finished: bool,

    /// The server asked for LOAD DATA LOCAL INFILE content.
    local_infile_pending: bool,

    /// The client sent the zero-length end-of-data packet.
    infile_done: bool,

    /// First byte of the authentication result, driving the transition
    /// out of `SEND_AUTH_RESULT`.
    auth_result_state: Option<u8>,

    /// A `COM_CHANGE_USER` realignment is awaiting its answer.
    change_user_in_flight: bool,

    shutdown: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(
        client: Socket,
        registry: Arc<BackendRegistry>,
        policy: Arc<dyn PolicyHook>,
        options: ConnectionOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: State::Init,
            client,
            server: None,
            backend: None,
            registry,
            policy,
            options,
            command: None,
            tracker: None,
            injection: VecDeque::new(),
            resultset_is_needed: false,
            result_buffer: Vec::new(),
            client_reply: Vec::new(),
            is_overlong: false,
            result_overlong: false,
            result_finished: false,
            local_infile_pending: false,
            infile_done: false,
            auth_result_state: None,
            change_user_in_flight: false,
            shutdown,
        }
    }

    /// Drive the connection from `INIT` to one of the terminal states,
    /// then run the cleanup path.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => {}

            Err(Error::Timeout) => {
                self.call_timeout_hook();
                tracing::debug!("connection timed out");
            }

            Err(e) if e.is_disconnect() => {
                tracing::debug!("peer disconnected: {e}");
            }

            Err(Error::Shutdown) => {
                tracing::debug!("connection drained for shutdown");
            }

            Err(e) => {
                tracing::warn!("connection failed: {e}");
            }
        }

        self.cleanup();
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            tracing::trace!(state = ?self.state, "connection step");

            match self.state {
                State::Init => self.on_init()?,
                State::ConnectServer => self.on_connect_server().await?,
                State::ReadHandshake => self.on_read_handshake().await?,
                State::SendHandshake => self.on_send_handshake().await?,
                State::ReadAuth => self.on_read_auth().await?,
                State::SendAuth => self.on_send_auth().await?,
                State::ReadAuthResult => self.on_read_auth_result().await?,
                State::SendAuthResult => self.on_send_auth_result().await?,
                State::ReadAuthOldPassword => self.on_read_auth_old_password().await?,
                State::SendAuthOldPassword => self.on_send_auth_old_password().await?,
                State::ReadQuery => self.on_read_query().await?,
                State::SendQuery => self.on_send_query().await?,
                State::ReadQueryResult => self.on_read_query_result().await?,
                State::SendQueryResult => self.on_send_query_result().await?,
                State::ReadLocalInfileData => self.on_read_local_infile_data().await?,
                State::SendLocalInfileData => self.on_send_local_infile_data().await?,
                State::ReadLocalInfileResult => self.on_read_local_infile_result().await?,
                State::SendLocalInfileResult => self.on_send_local_infile_result().await?,
                State::SendError => self.on_send_error().await?,

                State::CloseClient | State::Error => return Ok(()),
            }
        }
    }

    // ---- connection phase ------------------------------------------

    fn on_init(&mut self) -> Result<()> {
        let decision = self.call_hook(Hook::Init, None)?;
        if self.state == State::SendError {
            return Ok(());
        }

        match decision {
            Decision::SendResult => {
                self.flush_reply_to_client();
                self.state = State::SendHandshake;
            }

            _ => self.state = State::ConnectServer,
        }

        Ok(())
    }

    async fn on_connect_server(&mut self) -> Result<()> {
        let decision = self.call_hook(Hook::ConnectServer, None)?;
        if self.state == State::SendError {
            return Ok(());
        }

        if decision == Decision::SendResult {
            self.flush_reply_to_client();
            self.state = State::SendHandshake;
            return Ok(());
        }

        loop {
            self.registry.check_wakeup();

            let Some(backend) = self.registry.pick_rw() else {
                // nothing left to try; refuse in the oldest dialect
                // since the client's protocol version is still unknown
                let err = ErrPacket::new(ER_UNKNOWN_ERROR, "", "(proxy) all backends are down");
                let mut buf = Vec::new();
                err.encode_pre41(&mut buf);

                self.client.framer.reset();
                self.client.queue_payload(&buf);

                tracing::error!("cannot connect, all backends are down");
                self.state = State::SendError;
                return Ok(());
            };

            // a pooled socket skips the server-side handshake and auth
            if self.options.pool_reuse {
                if let Some((server, _same_user)) = backend.pool.get("") {
                    // without the original challenge the client's
                    // scramble could never be checked; connect fresh
                    if server.challenge.is_some() {
                        tracing::debug!(backend = %backend.addr, "reusing pooled connection");

                        backend.client_connected();
                        self.synthesize_client_handshake(&server);
                        self.server = Some(server);
                        self.backend = Some(backend);
                        self.state = State::SendHandshake;
                        return Ok(());
                    }
                }
            }

            let connect = Socket::connect(&backend.addr);
            let connected = match self.options.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(io::ErrorKind::TimedOut.into()),
                },
                None => connect.await,
            };

            match connected {
                Ok(server) => {
                    backend.set_state(BackendState::Up);
                    backend.client_connected();

                    self.server = Some(server);
                    self.backend = Some(backend);
                    self.state = State::ReadHandshake;
                    return Ok(());
                }

                Err(e) => {
                    tracing::warn!(backend = %backend.addr, "connect failed: {e}");
                    backend.set_state(BackendState::Down);

                    // loop around and try the next candidate
                }
            }
        }
    }

    /// Greet the client with the pooled socket's original challenge so
    /// its scramble stays verifiable against the cached response.
    fn synthesize_client_handshake(&mut self, server: &Socket) {
        let Some(challenge) = server.challenge.clone() else {
            return;
        };

        let mut forwarded = challenge.clone();
        forwarded.capabilities =
            (forwarded.capabilities - Capabilities::unsupported()) | Capabilities::base();

        let mut buf = Vec::new();
        forwarded.encode(&mut buf);

        self.client.framer.reset();
        self.client.queue_payload(&buf);
        self.client.challenge = Some(forwarded);
    }

    async fn on_read_handshake(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self.server.as_mut().expect("server present in READ_HANDSHAKE");

        let frame = recv_packet(server, limit, &mut shutdown).await?;
        let payload = packet::payload(&frame);

        // the server may greet with an ERR (max_connections, host
        // blocked); relay it and give up
        if payload.first() == Some(&0xFF) {
            self.client.queue_frame(frame);
            self.state = State::SendError;
            return Ok(());
        }

        let challenge = match crate::protocol::connect::Handshake::decode(payload) {
            Ok(challenge) => challenge,
            Err(e) => {
                tracing::warn!("bad handshake from backend: {e}");
                self.queue_client_err(&ErrPacket::new(
                    ER_UNKNOWN_ERROR,
                    "",
                    "(proxy) invalid handshake from backend",
                ));
                self.state = State::SendError;
                return Ok(());
            }
        };

        // servers in the bug-25371 window double their COM_CHANGE_USER
        // error; refuse them unless the workaround is on
        if BUG_25371_WINDOW.contains(&challenge.version) && !self.options.fix_bug_25371 {
            tracing::warn!(
                version = %challenge.server_version,
                "backend is in the bug-25371 window, refusing"
            );
            self.state = State::Error;
            return Ok(());
        }

        let server = self.server.as_mut().expect("server still present");
        server.capabilities = challenge.capabilities;
        server.challenge = Some(challenge.clone());

        let decision = self.call_hook(Hook::ReadHandshake, Some(payload))?;
        if self.state == State::SendError {
            return Ok(());
        }

        if decision == Decision::SendResult {
            self.flush_reply_to_client();
            self.state = State::SendError;
            return Ok(());
        }

        // strip what we cannot relay before the client sees it
        let mut forwarded = challenge;
        forwarded.capabilities =
            (forwarded.capabilities - Capabilities::unsupported()) | Capabilities::base();

        let mut buf = Vec::new();
        forwarded.encode(&mut buf);

        self.client.framer.reset();
        self.client.queue_payload(&buf);
        self.client.challenge = Some(forwarded);

        self.state = State::SendHandshake;
        Ok(())
    }

    async fn on_send_handshake(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();

        flush_queue(&mut self.client, limit, &mut shutdown).await?;

        self.state = State::ReadAuth;
        Ok(())
    }

    async fn on_read_auth(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();

        let frame = match recv_packet(&mut self.client, limit, &mut shutdown).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                self.state = State::CloseClient;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let payload = packet::payload(&frame);

        let auth = match AuthResponse::decode(payload) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!("bad auth response from client: {e}");
                self.queue_client_err(&ErrPacket::new(
                    ER_UNKNOWN_ERROR,
                    "",
                    "(proxy) invalid authentication packet",
                ));
                self.state = State::SendError;
                return Ok(());
            }
        };

        if !auth.capabilities.contains(Capabilities::PROTOCOL_41) {
            // the refusal must be readable by a 4.0 client: old ERR
            // encoding, packet id 0
            let err = ErrPacket::new(0x07D7, "", "4.0 protocol is not supported");
            let mut buf = Vec::new();
            err.encode_pre41(&mut buf);

            self.client.framer.reset();
            self.client.queue_payload(&buf);
            self.state = State::SendError;
            return Ok(());
        }

        if auth.auth_plugin.as_deref() == Some("authentication_windows_client") {
            self.queue_client_err(&ErrPacket::new(
                ER_UNKNOWN_ERROR,
                "HY000",
                "authentication plugin 'authentication_windows_client' is not supported",
            ));
            self.state = State::SendError;
            return Ok(());
        }

        self.client.capabilities = auth.capabilities;
        self.client.default_db = auth.database.clone().unwrap_or_default();
        self.client.response = Some(auth.clone());

        let decision = self.call_hook(Hook::ReadAuth, Some(packet::payload(&frame)))?;
        if self.state == State::SendError {
            return Ok(());
        }

        if decision == Decision::SendResult {
            self.flush_reply_to_client();
            self.auth_result_state = Some(0x00);
            self.state = State::SendAuthResult;
            return Ok(());
        }

        let Some(server) = self.server.as_mut() else {
            // a policy served the handshake without a backend and then
            // declined to answer the login
            self.queue_client_err(&ErrPacket::access_denied(&auth.username));
            self.auth_result_state = Some(0xFF);
            self.state = State::SendAuthResult;
            return Ok(());
        };

        if server.is_authed() {
            // pooled socket: past auth on the server side already
            if self.options.pool_change_user {
                let mut buf = Vec::new();
                auth.encode_change_user(&mut buf);

                server.framer.reset();
                server.queue_payload(&buf);
                server.response = Some(auth);

                self.change_user_in_flight = true;
                self.state = State::SendAuth;
            } else {
                // realignment is off: identities must agree exactly
                let cached = server.response.as_ref();
                let matches = cached.map_or(false, |cached| {
                    cached.username == auth.username && cached.scramble == auth.scramble
                });

                if matches {
                    let mut buf = Vec::new();
                    OkPacket::new().encode(&mut buf);
                    self.client.queue_payload(&buf);

                    self.auth_result_state = Some(0x00);
                    self.state = State::SendAuthResult;
                } else {
                    self.queue_client_err(&ErrPacket::access_denied(&auth.username));
                    self.auth_result_state = Some(0xFF);
                    self.state = State::SendAuthResult;
                }
            }
        } else {
            server.queue_frame(frame);
            server.response = Some(auth);
            self.state = State::SendAuth;
        }

        Ok(())
    }

    async fn on_send_auth(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self.server.as_mut().expect("server present in SEND_AUTH");

        match flush_queue(server, limit, &mut shutdown).await {
            Ok(()) => {
                self.state = State::ReadAuthResult;
                Ok(())
            }

            Err(Error::Timeout) => {
                // the client is still owed an answer
                self.queue_client_err(&ErrPacket::new(
                    ER_UNKNOWN_ERROR,
                    "HY000",
                    "(proxy) backend timed out during authentication",
                ));
                self.auth_result_state = Some(0xFF);
                self.state = State::SendAuthResult;
                Ok(())
            }

            Err(e) => Err(e),
        }
    }

    async fn on_read_auth_result(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self
            .server
            .as_mut()
            .expect("server present in READ_AUTH_RESULT");

        let frame = recv_packet(server, limit, &mut shutdown).await?;
        let payload = packet::payload(&frame).to_vec();

        let status = *payload
            .first()
            .ok_or_else(|| err_protocol!("zero-length authentication result"))?;

        self.auth_result_state = Some(status);

        if status == 0x00 {
            server.set_authed(true);
            server.default_db = self.client.default_db.clone();
        }

        // bug #25371: a failed COM_CHANGE_USER in the window is answered
        // twice; swallow the echo when the workaround is on
        if status == 0xFF && self.change_user_in_flight && self.options.fix_bug_25371 {
            let in_window = server
                .challenge
                .as_ref()
                .is_some_and(|c| BUG_25371_WINDOW.contains(&c.version));

            if in_window {
                let dup = recv_packet(server, limit, &mut shutdown).await?;
                if packet::payload(&dup).first() != Some(&0xFF) {
                    return Err(err_protocol!(
                        "expected the duplicate ERR of bug #25371, got something else"
                    ));
                }
                tracing::debug!("suppressed duplicate ERR (bug #25371)");
            }
        }

        self.change_user_in_flight = false;

        self.call_hook(Hook::ReadAuthResult, Some(&payload))?;
        if self.state == State::SendError {
            return Ok(());
        }

        // re-stamp rather than forward verbatim: on the change-user path
        // the server-side sequence ids differ from the client's
        self.client.queue_payload(&payload);

        self.state = State::SendAuthResult;
        Ok(())
    }

    async fn on_send_auth_result(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();

        flush_queue(&mut self.client, limit, &mut shutdown).await?;

        match self.auth_result_state {
            Some(0x00) => {
                // auth completed: both directions restart their
                // sequence ids
                self.client.framer.reset();
                if let Some(server) = self.server.as_mut() {
                    server.framer.reset();
                }

                self.state = State::ReadQuery;
            }

            // auth-switch request (old password dance)
            Some(0xFE) => self.state = State::ReadAuthOldPassword,

            _ => self.state = State::Error,
        }

        Ok(())
    }

    async fn on_read_auth_old_password(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();

        let frame = match recv_packet(&mut self.client, limit, &mut shutdown).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                self.state = State::CloseClient;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let server = self
            .server
            .as_mut()
            .expect("server present in READ_AUTH_OLD_PASSWORD");
        server.queue_frame(frame);

        self.state = State::SendAuthOldPassword;
        Ok(())
    }

    async fn on_send_auth_old_password(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self
            .server
            .as_mut()
            .expect("server present in SEND_AUTH_OLD_PASSWORD");

        flush_queue(server, limit, &mut shutdown).await?;

        self.state = State::ReadAuthResult;
        Ok(())
    }

    // ---- command phase ---------------------------------------------

    async fn on_read_query(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();

        if !self.is_overlong {
            // a new command starts a fresh sequence
            self.client.framer.reset();
        }

        let frame = match recv_packet(&mut self.client, limit, &mut shutdown).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                self.state = State::CloseClient;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let payload = packet::payload(&frame);

        if self.is_overlong {
            // continuation of the previous frame: same command, no
            // re-classification
            self.is_overlong = packet::is_overlong(&frame);

            let server = self.server.as_mut().expect("server present for continuation");
            server.queue_frame(frame);
            self.state = State::SendQuery;
            return Ok(());
        }

        let Some(&opcode) = payload.first() else {
            self.queue_client_err(&ErrPacket::new(ER_UNKNOWN_ERROR, "", "empty command packet"));
            self.state = State::SendError;
            return Ok(());
        };

        let command = match Command::try_from(opcode) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("client sent an unknown command: {e}");
                self.queue_client_err(&ErrPacket::new(
                    ER_UNKNOWN_ERROR,
                    "HY000",
                    format!("unknown command 0x{opcode:02X}"),
                ));
                self.state = State::SendError;
                return Ok(());
            }
        };

        if command == Command::Query && payload.len() < 2 {
            self.queue_client_err(&ErrPacket::new(
                ER_UNKNOWN_ERROR,
                "",
                "COM_QUERY with an empty statement",
            ));
            self.state = State::SendError;
            return Ok(());
        }

        self.command = Some(command);
        self.tracker = match CommandTracker::for_command(command, payload) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                tracing::warn!("refusing command: {e}");
                self.queue_client_err(&ErrPacket::new(
                    ER_UNKNOWN_ERROR,
                    "HY000",
                    format!("{command:?} is not supported by this proxy"),
                ));
                self.state = State::SendError;
                return Ok(());
            }
        };

        self.resultset_is_needed = false;

        let decision = self.call_hook(Hook::ReadQuery, Some(packet::payload(&frame)))?;
        if self.state == State::SendError {
            return Ok(());
        }

        match decision {
            Decision::SendResult => {
                // the policy answered without the server
                self.flush_reply_to_client();
                self.command = None;
                self.tracker = None;
                self.result_finished = true;
                self.state = State::SendQueryResult;
                return Ok(());
            }

            Decision::SendQuery => {
                if self.send_next_injection()? {
                    return Ok(());
                }

                tracing::warn!("policy returned SendQuery with an empty injection queue");
            }

            Decision::IgnoreResult => {
                tracing::warn!("policy returned IgnoreResult outside of read_query_result");
            }

            Decision::NoDecision => {}
        }

        if command == Command::Quit {
            // nothing to forward; the server socket is still clean and
            // goes back to the pool on the way out
            self.state = State::CloseClient;
            return Ok(());
        }

        self.is_overlong = packet::is_overlong(&frame);

        let Some(server) = self.server.as_mut() else {
            self.queue_client_err(&ErrPacket::new(
                ER_UNKNOWN_ERROR,
                "HY000",
                "(proxy) no backend connection for this command",
            ));
            self.state = State::SendError;
            return Ok(());
        };

        server.framer.reset();
        server.queue_frame(frame);

        self.state = State::SendQuery;
        Ok(())
    }

    /// Send the next injected payload to the server; `true` if one was
    /// queued.
    fn send_next_injection(&mut self) -> Result<bool> {
        let Some(payload) = self.injection.pop_front() else {
            return Ok(false);
        };

        let opcode = *payload
            .first()
            .ok_or_else(|| err_protocol!("empty injected command"))?;
        let command = Command::try_from(opcode)?;

        self.command = Some(command);
        self.tracker = Some(CommandTracker::for_command(command, &payload)?);

        // injected results are for the policy, not the client
        self.resultset_is_needed = true;

        let server = self.server.as_mut().expect("server present for injection");
        server.framer.reset();
        server.queue_payload(&payload);

        self.state = State::SendQuery;
        Ok(true)
    }

    async fn on_send_query(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self.server.as_mut().expect("server present in SEND_QUERY");

        flush_queue(server, limit, &mut shutdown).await?;

        if self.is_overlong {
            // the command's remaining frames are still on the client
            self.state = State::ReadQuery;
            return Ok(());
        }

        match self.command {
            Some(command) if command.has_no_response() => {
                self.command = None;
                self.tracker = None;
                self.state = State::ReadQuery;
            }

            _ => {
                self.result_finished = false;
                self.result_buffer.clear();
                self.state = State::ReadQueryResult;
            }
        }

        Ok(())
    }

    async fn on_read_query_result(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            let server = self
                .server
                .as_mut()
                .expect("server present in READ_QUERY_RESULT");

            let frame = recv_packet(server, limit, &mut shutdown).await?;
            let payload = packet::payload(&frame);

            let mut finished = false;

            if self.result_overlong {
                // continuation of an oversized response packet: relay,
                // no classification
            } else {
                let tracker = self
                    .tracker
                    .as_mut()
                    .ok_or_else(|| err_protocol!("response without a command in flight"))?;

                finished = tracker.track(payload)?;
            }

            self.result_overlong = packet::is_overlong(&frame);

            if self
                .tracker
                .as_ref()
                .is_some_and(CommandTracker::is_local_infile)
            {
                self.local_infile_pending = true;
            }

            // mirror a successful USE into both sides
            if finished {
                if let (Some(CommandTracker::InitDb { db }), Some(&0x00)) =
                    (&self.tracker, payload.first())
                {
                    let db = db.clone();
                    self.client.default_db = db.clone();

                    let server = self.server.as_mut().expect("server still present");
                    server.default_db = db;
                }
            }

            if self.resultset_is_needed {
                self.result_buffer.push(frame);
            } else {
                self.client.queue_frame(frame);
            }

            if finished {
                self.result_finished = true;

                let payload_owned;
                let hook_payload = if self.result_buffer.is_empty() {
                    None
                } else {
                    payload_owned = self
                        .result_buffer
                        .iter()
                        .flat_map(|f| packet::payload(f).iter().copied())
                        .collect::<Vec<u8>>();
                    Some(&payload_owned[..])
                };

                let decision = self.call_hook(Hook::ReadQueryResult, hook_payload)?;
                if self.state == State::SendError {
                    return Ok(());
                }

                match decision {
                    Decision::IgnoreResult if self.resultset_is_needed => {
                        self.result_buffer.clear();
                    }

                    Decision::IgnoreResult => {
                        tracing::warn!(
                            "policy returned IgnoreResult without resultset_is_needed; forwarding"
                        );
                    }

                    Decision::SendResult => {
                        self.result_buffer.clear();
                        self.flush_reply_to_client();
                    }

                    _ => {}
                }

                for frame in self.result_buffer.drain(..) {
                    self.client.queue_frame(frame);
                }

                self.state = State::SendQueryResult;
                return Ok(());
            }

            // stream a large response before it is complete
            if !self.resultset_is_needed && self.client.send.len() > RESULT_FLUSH_THRESHOLD {
                self.state = State::SendQueryResult;
                return Ok(());
            }
        }
    }

    async fn on_send_query_result(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();

        flush_queue(&mut self.client, limit, &mut shutdown).await?;

        if !self.result_finished {
            // early flush of a streaming result
            self.state = State::ReadQueryResult;
            return Ok(());
        }

        if self.local_infile_pending {
            self.local_infile_pending = false;
            self.infile_done = false;
            self.state = State::ReadLocalInfileData;
            return Ok(());
        }

        if self.send_next_injection()? {
            return Ok(());
        }

        // a binlog stream never ends; keep relaying events
        if self.command == Some(Command::BinlogDump) {
            self.result_finished = false;
            self.state = State::ReadQueryResult;
            return Ok(());
        }

        self.command = None;
        self.tracker = None;
        self.resultset_is_needed = false;
        self.state = State::ReadQuery;
        Ok(())
    }

    // ---- LOAD DATA LOCAL INFILE side path --------------------------

    async fn on_read_local_infile_data(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();

        let frame = match recv_packet(&mut self.client, limit, &mut shutdown).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                self.state = State::CloseClient;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // a zero-length packet ends the file content
        self.infile_done = packet::payload(&frame).is_empty();

        let server = self
            .server
            .as_mut()
            .expect("server present in READ_LOCAL_INFILE_DATA");
        server.queue_frame(frame);

        self.state = State::SendLocalInfileData;
        Ok(())
    }

    async fn on_send_local_infile_data(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self
            .server
            .as_mut()
            .expect("server present in SEND_LOCAL_INFILE_DATA");

        flush_queue(server, limit, &mut shutdown).await?;

        if self.infile_done {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.infile_data_sent();
            }

            self.state = State::ReadLocalInfileResult;
        } else {
            self.state = State::ReadLocalInfileData;
        }

        Ok(())
    }

    async fn on_read_local_infile_result(&mut self) -> Result<()> {
        let limit = self.options.read_timeout;
        let mut shutdown = self.shutdown.clone();
        let server = self
            .server
            .as_mut()
            .expect("server present in READ_LOCAL_INFILE_RESULT");

        let frame = recv_packet(server, limit, &mut shutdown).await?;

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.track(packet::payload(&frame))?;
        }

        self.client.queue_frame(frame);
        self.state = State::SendLocalInfileResult;
        Ok(())
    }

    async fn on_send_local_infile_result(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();

        flush_queue(&mut self.client, limit, &mut shutdown).await?;

        self.command = None;
        self.tracker = None;
        self.state = State::ReadQuery;
        Ok(())
    }

    // ---- terminal paths --------------------------------------------

    async fn on_send_error(&mut self) -> Result<()> {
        let limit = self.options.write_timeout;
        let mut shutdown = self.shutdown.clone();

        // best effort; the connection dies either way
        if let Err(e) = flush_queue(&mut self.client, limit, &mut shutdown).await {
            tracing::debug!("could not deliver final error: {e}");
        }

        self.state = State::Error;
        Ok(())
    }

    fn cleanup(&mut self) {
        let mut ctx = HookContext {
            command: self.command,
            packet: None,
            injection: &mut self.injection,
            resultset_is_needed: &mut self.resultset_is_needed,
            client_reply: &mut self.client_reply,
        };
        self.policy.on_disconnect_client(&mut ctx);

        if let Some(mut server) = self.server.take() {
            if let Some(backend) = self.backend.take() {
                if self.state == State::CloseClient && server.is_authed() && server.is_quiet() {
                    server.framer.reset();

                    if backend.pool.add(server) {
                        tracing::debug!(backend = %backend.addr, "returned connection to pool");
                    }
                }

                backend.client_disconnected();
            }
        }
    }

    // ---- hooks and small helpers -----------------------------------

    fn call_hook(&mut self, hook: Hook, payload: Option<&[u8]>) -> Result<Decision> {
        let policy = Arc::clone(&self.policy);

        let mut ctx = HookContext {
            command: self.command,
            packet: payload,
            injection: &mut self.injection,
            resultset_is_needed: &mut self.resultset_is_needed,
            client_reply: &mut self.client_reply,
        };

        let decision = match hook {
            Hook::Init => policy.on_init(&mut ctx),
            Hook::ConnectServer => policy.on_connect_server(&mut ctx),
            Hook::ReadHandshake => policy.on_read_handshake(&mut ctx),
            Hook::ReadAuth => policy.on_read_auth(&mut ctx),
            Hook::ReadAuthResult => policy.on_read_auth_result(&mut ctx),
            Hook::ReadQuery => policy.on_read_query(&mut ctx),
            Hook::ReadQueryResult => policy.on_read_query_result(&mut ctx),
            Hook::Timeout => policy.on_timeout(&mut ctx),
        };

        match decision {
            Ok(decision) => Ok(decision),

            Err(e) => {
                tracing::error!("policy hook failed: {e}");

                self.queue_client_err(&ErrPacket::new(
                    ER_ACCESS_DENIED_ERROR,
                    "28000",
                    "(lua) handling proxy.response failed, check error-log",
                ));
                self.state = State::SendError;

                // the caller observes the state change and stands down
                Ok(Decision::NoDecision)
            }
        }
    }

    fn call_timeout_hook(&mut self) {
        let _ = self.call_hook(Hook::Timeout, None);
    }

    fn flush_reply_to_client(&mut self) {
        for payload in std::mem::take(&mut self.client_reply) {
            self.client.queue_payload(&payload);
        }
    }

    fn queue_client_err(&mut self, err: &ErrPacket) {
        let mut buf = Vec::new();
        err.encode(&mut buf);
        self.client.queue_payload(&buf);
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Init,
    ConnectServer,
    ReadHandshake,
    ReadAuth,
    ReadAuthResult,
    ReadQuery,
    ReadQueryResult,
    Timeout,
}

// ---- suspendable I/O steps ----------------------------------------

/// Await an I/O readiness future under the phase timeout, bailing out
/// on shutdown.
async fn wait_io<F>(
    io: F,
    limit: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let io = async {
        match limit {
            Some(limit) => match tokio::time::timeout(limit, io).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Timeout),
            },

            None => io.await.map_err(Error::from),
        }
    };

    tokio::select! {
        biased;

        _ = shutdown.changed() => Err(Error::Shutdown),
        result = io => result,
    }
}

/// Read until one whole frame is available.
async fn recv_packet(
    sock: &mut Socket,
    limit: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Bytes> {
    loop {
        if let Some(frame) = sock.pop_packet() {
            return Ok(frame);
        }

        match sock.receive()? {
            IoStatus::Ready => {}
            IoStatus::Closed => return Err(Error::PeerClosed),
            IoStatus::WaitForEvent => wait_io(sock.readable(), limit, shutdown).await?,
        }
    }
}

/// Drain the send queue.
async fn flush_queue(
    sock: &mut Socket,
    limit: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        match sock.try_flush()? {
            IoStatus::Ready => return Ok(()),
            IoStatus::Closed => return Err(Error::PeerClosed),
            IoStatus::WaitForEvent => wait_io(sock.writable(), limit, shutdown).await?,
        }
    }
}
