use tollgate_core::error::Result;
use tollgate_core::policy::{Decision, HookContext, PolicyHook};
use tollgate_core::protocol::Command;

/// The stock proxy policy: pass everything through, leaving a trace of
/// the query stream for the operator.
///
/// Connection pooling itself is steered by the connection options, not
/// by this hook; replacing this type is the intended way to script the
/// proxy.
pub struct ProxyPolicy;

impl PolicyHook for ProxyPolicy {
    fn on_read_query(&self, ctx: &mut HookContext<'_>) -> Result<Decision> {
        if ctx.command == Some(Command::Query) {
            if let Some(payload) = ctx.packet {
                let sql = String::from_utf8_lossy(&payload[1..]);
                tracing::debug!(query = %sql, "forwarding");
            }
        }

        Ok(Decision::NoDecision)
    }

    fn on_read_query_result(&self, _ctx: &mut HookContext<'_>) -> Result<Decision> {
        Ok(Decision::NoDecision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn it_forwards_queries_untouched() {
        let policy = ProxyPolicy;

        let mut injection = VecDeque::new();
        let mut resultset_is_needed = false;
        let mut client_reply = Vec::new();

        let mut ctx = HookContext {
            command: Some(Command::Query),
            packet: Some(b"\x03SELECT 1"),
            injection: &mut injection,
            resultset_is_needed: &mut resultset_is_needed,
            client_reply: &mut client_reply,
        };

        assert_eq!(
            policy.on_read_query(&mut ctx).unwrap(),
            Decision::NoDecision
        );
        assert!(client_reply.is_empty());
        assert!(!resultset_is_needed);
    }
}
