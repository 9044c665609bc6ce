//! The seam between the state machine and operator-supplied behavior.
//!
//! The core calls a [`PolicyHook`] at fixed interception points and acts
//! on the returned [`Decision`]. Hooks run synchronously inside the
//! connection's worker; anything long-running belongs in the hook's own
//! machinery, not here.

use std::collections::VecDeque;

use crate::error::Result;
use crate::protocol::response::{ErrPacket, OkPacket};
use crate::protocol::{Command, Resultset};

/// What the state machine should do after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Proceed with the default behavior.
    #[default]
    NoDecision,

    /// The hook wrote a response for the client; skip the server and go
    /// send it.
    SendResult,

    /// Drain the injection queue towards the server before (or instead
    /// of) the client's packet.
    SendQuery,

    /// Drop the server's result silently. Only meaningful in
    /// `on_read_query_result`.
    IgnoreResult,
}

/// The slice of connection state a hook may inspect and steer.
pub struct HookContext<'a> {
    /// Opcode of the command in flight, if one is.
    pub command: Option<Command>,

    /// Payload of the packet that triggered this hook, header stripped.
    pub packet: Option<&'a [u8]>,

    /// Synthetic command payloads to send to the server under a
    /// `SendQuery` decision, drained front-first.
    pub injection: &'a mut VecDeque<Vec<u8>>,

    /// Ask the core to buffer the command's result set so
    /// `on_read_query_result` sees it whole (and may ignore it).
    pub resultset_is_needed: &'a mut bool,

    /// Packet payloads queued for the client under a `SendResult`
    /// decision.
    pub client_reply: &'a mut Vec<Vec<u8>>,
}

impl HookContext<'_> {
    pub fn reply_ok(&mut self, ok: &OkPacket) {
        let mut buf = Vec::new();
        ok.encode(&mut buf);
        self.client_reply.push(buf);
    }

    pub fn reply_err(&mut self, err: &ErrPacket) {
        let mut buf = Vec::new();
        err.encode(&mut buf);
        self.client_reply.push(buf);
    }

    pub fn reply_resultset(&mut self, resultset: &Resultset) {
        self.client_reply.extend(resultset.packets());
    }

    pub fn inject_query(&mut self, sql: &str) {
        let mut buf = Vec::with_capacity(sql.len() + 1);
        buf.push(Command::Query as u8);
        buf.extend_from_slice(sql.as_bytes());
        self.injection.push_back(buf);
    }
}

/// Interception points of the connection state machine.
///
/// Every method defaults to `NoDecision`; a hook error surfaces to the
/// client as a generic policy-failure ERR. Invalid decisions (for the
/// hook point in question) are logged and treated as `NoDecision`.
#[allow(unused_variables)]
pub trait PolicyHook: Send + Sync + 'static {
    fn on_init(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_connect_server(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_read_handshake(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_read_auth(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_read_auth_result(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_read_query(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_read_query_result(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    fn on_timeout(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }

    /// Cleanup notification; the connection is past the point of
    /// steering.
    fn on_disconnect_client(&self, ctx: &mut HookContext<'_>) {}
}

/// The pass-through policy.
pub struct NoopPolicy;

impl PolicyHook for NoopPolicy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_builds_replies_through_the_context() {
        let mut injection = VecDeque::new();
        let mut resultset_is_needed = false;
        let mut client_reply = Vec::new();

        let mut ctx = HookContext {
            command: Some(Command::Query),
            packet: None,
            injection: &mut injection,
            resultset_is_needed: &mut resultset_is_needed,
            client_reply: &mut client_reply,
        };

        ctx.reply_ok(&OkPacket::new());
        ctx.inject_query("SELECT NOW()");

        assert_eq!(client_reply.len(), 1);
        assert_eq!(client_reply[0][0], 0x00);
        assert_eq!(injection.len(), 1);
        assert_eq!(&injection[0][..1], &[0x03]);
    }
}
