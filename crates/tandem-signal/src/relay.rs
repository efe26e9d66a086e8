//! Forwarding of signaling messages between the two occupants of a room

use std::time::Duration;

use tracing::debug;

use tandem_core::{MessageKind, SignalError, SignalingMessage};

use crate::room::RoomMembership;
use crate::transport::{send_message_within, send_text_within};

/// What happened to one inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to the partner
    Forwarded,
    /// No partner yet; dropped
    NoPartner,
    /// `ping` answered with `pong`
    Ponged,
    /// Server-only message, not forwarded
    Consumed,
}

/// Best-effort relay between room occupants
///
/// Each forward is bounded by `send_timeout`. Failures are reported to the
/// caller and never retried.
#[derive(Clone, Debug)]
pub struct MessageRelay {
    send_timeout: Duration,
}

impl MessageRelay {
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Handle one text frame read from `membership`'s stream
    pub async fn handle(
        &self,
        membership: &RoomMembership,
        text: String,
    ) -> Result<RelayOutcome, SignalError> {
        let msg = SignalingMessage::from_json(&text)?;

        match msg.kind() {
            MessageKind::Ping => {
                let pong = SignalingMessage::pong();
                send_message_within(membership.sink().as_ref(), &pong, self.send_timeout).await?;
                Ok(RelayOutcome::Ponged)
            }
            MessageKind::Register => {
                debug!(
                    "Ignoring repeated register from {} in room {}",
                    membership.peer_id(),
                    membership.room_id()
                );
                Ok(RelayOutcome::Consumed)
            }
            MessageKind::Relay => self.forward(membership, &msg, text).await,
        }
    }

    /// Forward the raw text to the partner, if there is one
    async fn forward(
        &self,
        membership: &RoomMembership,
        msg: &SignalingMessage,
        text: String,
    ) -> Result<RelayOutcome, SignalError> {
        let Some(partner) = membership.partner() else {
            debug!(
                "Dropping {:?} from {} in room {}: no partner",
                msg.message_type(),
                membership.peer_id(),
                membership.room_id()
            );
            return Ok(RelayOutcome::NoPartner);
        };

        send_text_within(partner.as_ref(), text, self.send_timeout)
            .await
            .map_err(|e| match e {
                // The partner going away only fails this attempt
                SignalError::Disconnected => SignalError::Send("partner disconnected".into()),
                other => other,
            })?;

        debug!(
            "Relayed {:?} from {} in room {}",
            msg.message_type(),
            membership.peer_id(),
            membership.room_id()
        );
        Ok(RelayOutcome::Forwarded)
    }
}
