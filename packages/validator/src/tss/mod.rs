//! Threshold-ECDSA primitive, driven as a black box.
//!
//! The MPC protocol itself is the `cggmp24` crate; this module only moves
//! its round messages over the party bus and persists the resulting
//! keyshare. The protocol state machines are synchronous; the driver
//! interleaves them with async bus sends and waits. Round messages are
//! consumed when handed to the state machine: decoded payloads move in by
//! value and are never reused.

pub mod keygen;
pub mod keyshare;
pub mod sign;

use std::time::Duration;

use base64::Engine;
use eyre::{eyre, Result};
use round_based::state_machine::{ProceedResult, StateMachine};
use round_based::{Incoming, MessageDestination, MessageType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Envelope, MessageBus};

/// One serialized protocol round message, addressed by wire party id.
/// `to_id = None` means broadcast to all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMsg {
    pub from_id: u16,
    pub to_id: Option<u16>,
    /// base64 of the JSON-encoded protocol message.
    pub payload: String,
}

/// Transport contract the protocol driver runs over: `send` groups
/// outgoing messages by recipient, `wait` blocks for the next inbound
/// payload addressed to this party (or broadcast).
pub struct BusTransport<'a> {
    bus: &'a MessageBus,
    msg_type: &'static str,
    session_id: String,
    deadline: Instant,
}

impl<'a> BusTransport<'a> {
    pub fn new(
        bus: &'a MessageBus,
        msg_type: &'static str,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            msg_type,
            session_id: session_id.into(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Every round message must arrive or the protocol stalls until its
    /// timeout, so deliveries are retried per recipient rather than
    /// tolerated as lost the way consensus traffic is.
    async fn send(&self, msg: &RoundMsg) -> Result<()> {
        let envelope = Envelope {
            sender_id: self.bus.party_id(),
            session_id: self.session_id.clone(),
            msg_type: self.msg_type.to_string(),
            data: serde_json::to_value(msg)?,
        };
        let recipients: Vec<u16> = match msg.to_id {
            Some(peer) => vec![peer],
            None => (0..self.bus.total_parties())
                .filter(|id| *id != self.bus.party_id())
                .collect(),
        };
        for peer in recipients {
            self.send_with_retry(peer, &envelope).await?;
        }
        Ok(())
    }

    async fn send_with_retry(&self, peer: u16, envelope: &Envelope) -> Result<()> {
        const ATTEMPTS: u32 = 5;
        let mut last_err = None;
        for attempt in 0..ATTEMPTS {
            match self.bus.send_to(peer, envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer, attempt, error = %e, "Round message delivery failed; retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| eyre!("round message delivery failed")))
    }

    async fn wait(&self) -> Result<RoundMsg> {
        let me = self.bus.party_id();
        loop {
            let remaining = self
                .deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| eyre!("timed out waiting for {} round message", self.msg_type))?;

            let envelope = self
                .bus
                .wait_for(self.msg_type, std::slice::from_ref(&self.session_id), remaining)
                .await
                .ok_or_else(|| eyre!("timed out waiting for {} round message", self.msg_type))?;

            let msg: RoundMsg = serde_json::from_value(envelope.data)
                .map_err(|e| eyre!("malformed {} round message: {e}", self.msg_type))?;

            // Directed traffic for another party (should not reach us, but
            // filter defensively the way the wire contract states it).
            match msg.to_id {
                Some(to) if to != me => {
                    debug!(to, "Skipping round message addressed elsewhere");
                    continue;
                }
                _ => return Ok(msg),
            }
        }
    }
}

/// Drive a protocol state machine to completion over the bus.
///
/// `parties` maps protocol positions (0-based, what the state machine
/// speaks) to wire party ids; `my_position` is this party's index into it.
pub async fn drive<SM, O, E>(
    mut sm: SM,
    transport: &BusTransport<'_>,
    my_position: u16,
    parties: &[u16],
) -> Result<O>
where
    SM: StateMachine<Output = Result<O, E>>,
    SM::Msg: Serialize + DeserializeOwned,
    E: std::fmt::Debug,
{
    let b64 = base64::engine::general_purpose::STANDARD;
    loop {
        match sm.proceed() {
            ProceedResult::SendMsg(outgoing) => {
                let payload = b64.encode(serde_json::to_vec(&outgoing.msg)?);
                let to_id = match outgoing.recipient {
                    MessageDestination::AllParties => None,
                    MessageDestination::OneParty(pos) => Some(
                        *parties
                            .get(pos as usize)
                            .ok_or_else(|| eyre!("protocol addressed unknown position {pos}"))?,
                    ),
                };
                let msg = RoundMsg {
                    from_id: parties[my_position as usize],
                    to_id,
                    payload,
                };
                transport.send(&msg).await?;
            }
            ProceedResult::NeedsOneMoreMessage => {
                let msg = transport.wait().await?;
                let sender_position = parties
                    .iter()
                    .position(|p| *p == msg.from_id)
                    .ok_or_else(|| eyre!("round message from unknown party {}", msg.from_id))?
                    as u16;
                let decoded: SM::Msg = serde_json::from_slice(&b64.decode(&msg.payload)?)
                    .map_err(|e| eyre!("undecodable round payload: {e}"))?;

                // The message is moved into the state machine here and must
                // not be touched again.
                let incoming = Incoming {
                    id: 0,
                    sender: sender_position,
                    msg_type: if msg.to_id.is_none() {
                        MessageType::Broadcast
                    } else {
                        MessageType::P2P
                    },
                    msg: decoded,
                };
                sm.received_msg(incoming)
                    .map_err(|_| eyre!("state machine refused round message"))?;
            }
            ProceedResult::Output(result) => {
                return result.map_err(|e| eyre!("protocol failed: {e:?}"));
            }
            ProceedResult::Yielded => {}
            ProceedResult::Error(e) => {
                return Err(eyre!("protocol execution error: {e}"));
            }
        }
    }
}
