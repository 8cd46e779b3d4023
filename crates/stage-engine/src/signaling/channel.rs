//! Per-session signaling channel client.
//!
//! Wraps a [`SignalingTransport`] subscription for one stage: outbound sends
//! are stamped with the local identity, inbound delivery filters messages
//! addressed to other participants. A closed inbound stream is the
//! disconnect signal the orchestrator's reconnection policy reacts to.

use crate::errors::SignalingError;
use crate::signaling::{JoinAck, SignalingBody, SignalingMessage, SignalingTransport, StageMember};
use crate::types::{StageId, UserId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A joined signaling subscription for one stage.
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    stage_id: StageId,
    local_user_id: UserId,
    incoming: mpsc::Receiver<SignalingMessage>,
}

impl SignalingChannel {
    /// Join the stage with a bounded timeout.
    ///
    /// Returns the channel and the participants already present.
    pub async fn join(
        transport: Arc<dyn SignalingTransport>,
        stage_id: StageId,
        local_user_id: UserId,
        timeout: Duration,
    ) -> Result<(Self, Vec<StageMember>), SignalingError> {
        let ack = tokio::time::timeout(timeout, transport.join(&stage_id, &local_user_id))
            .await
            .map_err(|_| SignalingError::Timeout)??;

        let JoinAck { members, incoming } = ack;
        debug!(
            target: "stage.signaling",
            stage_id = %stage_id,
            user_id = %local_user_id,
            present = members.len(),
            "Joined signaling channel"
        );

        Ok((
            Self {
                transport,
                stage_id,
                local_user_id,
                incoming,
            },
            members,
        ))
    }

    /// Broadcast a payload to the whole stage.
    pub fn broadcast(&self, body: SignalingBody) {
        self.dispatch(None, body);
    }

    /// Send a payload to one participant.
    pub fn send_to(&self, to: UserId, body: SignalingBody) {
        self.dispatch(Some(to), body);
    }

    fn dispatch(&self, to_user_id: Option<UserId>, body: SignalingBody) {
        trace!(
            target: "stage.signaling",
            stage_id = %self.stage_id,
            kind = body.kind(),
            to = to_user_id.as_ref().map(|u| u.0.as_str()).unwrap_or("*"),
            "Sending signaling message"
        );
        self.transport.send(SignalingMessage {
            stage_id: self.stage_id.clone(),
            from_user_id: self.local_user_id.clone(),
            to_user_id,
            body,
        });
    }

    /// Receive the next message addressed to the local participant.
    ///
    /// Skips messages targeted at other users and anything echoing the local
    /// sender (a transport may loop messages back). Returns `None` once the
    /// transport closes the stream, i.e. on disconnect.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let message = self.incoming.recv().await?;
            if message.from_user_id == self.local_user_id {
                continue;
            }
            if !message.addressed_to(&self.local_user_id) {
                continue;
            }
            return Some(message);
        }
    }

    /// Leave the stage. Consumes the channel; constructing a new one is the
    /// only way back in.
    pub async fn leave(self) {
        debug!(
            target: "stage.signaling",
            stage_id = %self.stage_id,
            user_id = %self.local_user_id,
            "Leaving signaling channel"
        );
        self.transport
            .leave(&self.stage_id, &self.local_user_id)
            .await;
    }

    /// Stage this channel is joined to.
    #[must_use]
    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("stage_id", &self.stage_id)
            .field("local_user_id", &self.local_user_id)
            .finish_non_exhaustive()
    }
}
