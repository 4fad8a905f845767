//! Message dispatcher: bridges the transport inbox to the core handlers.
//!
//! ```text
//! transport decodes a frame → (from, Message) → dispatch_loop
//!     ↓
//! match on kind → RaftCore::handle_*
//!     ↓
//! request kinds produce a reply, sent back through the transport
//! ```
//!
//! Replies are addressed by the id carried inside the request (candidate or
//! leader id), never by the connection the frame arrived on.

use crate::state::RaftCore;
use crate::transport::{Inbox, RaftTransport};
use crate::types::*;
use crate::RaftError;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Consume the inbox until shutdown or the transport closes it.
pub(crate) async fn dispatch_loop(
    core: Arc<RaftCore>,
    transport: Arc<dyn RaftTransport>,
    mut inbox: Inbox,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            received = inbox.recv() => {
                match received {
                    Some((from, message)) => {
                        handle_message(&core, &transport, from, message).await;
                        if !core.is_running() {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!("transport inbox closed, exiting dispatcher");
                        return;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("dispatcher shutting down");
                return;
            }
        }
    }
}

async fn handle_message(
    core: &Arc<RaftCore>,
    transport: &Arc<dyn RaftTransport>,
    from: NodeId,
    message: Message,
) {
    tracing::trace!(node = %core.id(), %from, kind = message.kind(), "dispatching");

    match message {
        Message::VoteRequest(req) => {
            let candidate = req.candidate_id;
            match core.handle_vote_request(&req) {
                Ok(resp) => reply(transport, candidate, Message::VoteResponse(resp)).await,
                Err(error) => fatal(core, error),
            }
        }
        Message::VoteResponse(resp) => {
            if let Err(error) = core.handle_vote_response(&resp) {
                fatal(core, error);
            }
        }
        Message::AppendRequest(req) => {
            let leader = req.leader_id;
            match core.handle_append_request(&req) {
                Ok(resp) => reply(transport, leader, Message::AppendResponse(resp)).await,
                Err(error) => fatal(core, error),
            }
        }
        Message::AppendResponse(resp) => {
            if let Err(error) = core.handle_append_response(&resp) {
                fatal(core, error);
            }
        }
    }
}

async fn reply(transport: &Arc<dyn RaftTransport>, target: NodeId, message: Message) {
    if let Err(error) = transport.send(target, message).await {
        tracing::debug!(%target, %error, "reply send failed");
    }
}

/// Handler errors are hard-state or log persistence failures; the node
/// cannot safely continue without its durable state.
fn fatal(core: &Arc<RaftCore>, error: RaftError) {
    tracing::error!(node = %core.id(), %error, "unrecoverable consensus failure, stopping node");
    core.stop();
}
