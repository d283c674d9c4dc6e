//! Reliable watch link
//!
//! Builds acknowledged, ordered, de-duplicated delivery on top of a lossy,
//! reordering byte channel. The channel does no I/O of its own: frames to send
//! are queued for the transport driver ([`LinkChannel::drain_outbound`]), and
//! retries, heartbeats and liveness are evaluated whenever the owner calls
//! [`LinkChannel::poll`]. All state lives behind `&mut self`, so mutations are
//! serialized by ownership.
//!
//! Sequence numbers: reliable messages (classification and session events) are
//! numbered 1, 2, 3, ... per sender. Heartbeats and Acks are never acknowledged
//! or ordered; they carry the sender's current reliable watermark.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::error::Result;
use crate::wire::{MessageKind, WatchMessage};

/// Peer liveness as seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Things the owner of the channel needs to react to
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A reliable message from the peer, released in sequence order
    Delivered(WatchMessage),
    /// Retries exhausted for one of our messages
    DeliveryFailed {
        sequence_number: u64,
        attempts: u32,
        kind: MessageKind,
    },
    /// Nothing heard from the peer for two heartbeat intervals
    Disconnected { last_heard: DateTime<Utc> },
    Reconnected,
}

/// A sent message awaiting its Ack
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: WatchMessage,
    pub attempt_count: u32,
    pub last_sent_at: DateTime<Utc>,
    frame: Vec<u8>,
}

/// Sender-side link bookkeeping
#[derive(Debug, Clone)]
pub struct LinkState {
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    /// Last time any frame arrived from the peer
    pub last_peer_traffic_at: DateTime<Utc>,
    /// Last time we put any frame on the wire
    pub last_transmit_at: DateTime<Utc>,
    pub status: LinkStatus,
    pub pending_messages: BTreeMap<u64, PendingMessage>,
}

/// Receiver-side ordering state
#[derive(Debug, Clone, Default)]
struct Inbound {
    /// Every sequence number up to and including this one has been released
    delivered_through: u64,
    /// Arrived ahead of a missing predecessor
    buffered: BTreeMap<u64, WatchMessage>,
    /// When the current gap was first observed
    gap_since: Option<DateTime<Utc>>,
}

/// Reliable request/acknowledge channel to one peer
#[derive(Debug, Clone)]
pub struct LinkChannel {
    config: LinkConfig,
    next_sequence: u64,
    state: LinkState,
    inbound: Inbound,
    outbound: VecDeque<Vec<u8>>,
}

impl LinkChannel {
    pub fn new(config: &LinkConfig, now: DateTime<Utc>) -> Self {
        Self {
            config: config.clone(),
            next_sequence: 1,
            state: LinkState {
                last_heartbeat_sent: None,
                last_peer_traffic_at: now,
                last_transmit_at: now,
                status: LinkStatus::Connected,
                pending_messages: BTreeMap::new(),
            },
            inbound: Inbound::default(),
            outbound: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn status(&self) -> LinkStatus {
        self.state.status
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending_messages.len()
    }

    /// Highest sequence number assigned to a reliable message so far
    pub fn watermark(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Queue a message for delivery and transmit it immediately.
    ///
    /// Reliable kinds get a fresh sequence number and are retried until
    /// acknowledged; Heartbeat and Ack frames are sent once.
    pub fn send(&mut self, kind: MessageKind, now: DateTime<Utc>) -> Result<u64> {
        if !kind.is_reliable() {
            self.transmit_control(kind, now)?;
            return Ok(self.watermark());
        }

        let sequence_number = self.next_sequence;
        let message = WatchMessage {
            sequence_number,
            kind,
            sent_at: now,
        };
        let frame = message.encode()?;
        self.next_sequence += 1;

        debug!(sequence_number, kind = kind.name(), "link send");
        self.transmit(frame.clone(), now);
        self.state.pending_messages.insert(
            sequence_number,
            PendingMessage {
                message,
                attempt_count: 1,
                last_sent_at: now,
                frame,
            },
        );
        Ok(sequence_number)
    }

    /// Handle one inbound frame.
    ///
    /// Reliable messages are acknowledged on arrival (again, if repeated) and
    /// released in sequence order through [`LinkEvent::Delivered`].
    pub fn receive(&mut self, frame: &[u8], now: DateTime<Utc>) -> Result<Vec<LinkEvent>> {
        let message = WatchMessage::decode(frame)?;
        let mut events = Vec::new();

        self.state.last_peer_traffic_at = now;
        if self.state.status == LinkStatus::Disconnected {
            info!("link reconnected");
            self.state.status = LinkStatus::Connected;
            events.push(LinkEvent::Reconnected);
        }

        match message.kind {
            MessageKind::Ack {
                acked_sequence_number,
            } => {
                if self
                    .state
                    .pending_messages
                    .remove(&acked_sequence_number)
                    .is_some()
                {
                    debug!(sequence_number = acked_sequence_number, "link ack");
                }
            }
            MessageKind::Heartbeat => {
                debug!(peer_watermark = message.sequence_number, "link heartbeat received");
            }
            MessageKind::ClassificationEvent(_) | MessageKind::SessionEvent(_) => {
                let sequence_number = message.sequence_number;
                self.transmit_control(
                    MessageKind::Ack {
                        acked_sequence_number: sequence_number,
                    },
                    now,
                )?;

                if sequence_number <= self.inbound.delivered_through
                    || self.inbound.buffered.contains_key(&sequence_number)
                {
                    debug!(sequence_number, "duplicate message discarded");
                } else {
                    self.inbound.buffered.insert(sequence_number, message);
                    self.release_in_order(now, &mut events);
                }
            }
        }
        Ok(events)
    }

    /// Drive retries, heartbeats, gap expiry and liveness
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        self.retry_pending(now, &mut events);
        self.expire_gap(now, &mut events);

        if now - self.state.last_transmit_at >= self.config.heartbeat_interval() {
            if let Err(e) = self.transmit_control(MessageKind::Heartbeat, now) {
                warn!(error = %e, "failed to encode heartbeat");
            } else {
                self.state.last_heartbeat_sent = Some(now);
            }
        }

        if self.state.status == LinkStatus::Connected
            && now - self.state.last_peer_traffic_at >= self.config.disconnect_after()
        {
            warn!(last_heard = %self.state.last_peer_traffic_at, "link disconnected");
            self.state.status = LinkStatus::Disconnected;
            events.push(LinkEvent::Disconnected {
                last_heard: self.state.last_peer_traffic_at,
            });
        }
        events
    }

    /// Drop pending messages that refer to `session_id`, so a finished session
    /// is not resurrected by late retries. Returns how many were dropped.
    pub fn cancel_session(&mut self, session_id: Uuid) -> usize {
        let before = self.state.pending_messages.len();
        self.state
            .pending_messages
            .retain(|_, pending| pending.message.kind.session_id() != Some(session_id));
        let dropped = before - self.state.pending_messages.len();
        if dropped > 0 {
            debug!(session_id = %session_id, dropped, "cancelled pending session messages");
        }
        dropped
    }

    /// Frames waiting to be written to the transport, oldest first
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    /// Earliest time at which `poll` has work to do
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = self.config.timeout();
        let mut candidates = vec![self.state.last_transmit_at + self.config.heartbeat_interval()];
        candidates.extend(
            self.state
                .pending_messages
                .values()
                .map(|pending| pending.last_sent_at + timeout),
        );
        if self.state.status == LinkStatus::Connected {
            candidates.push(self.state.last_peer_traffic_at + self.config.disconnect_after());
        }
        if let Some(since) = self.inbound.gap_since {
            candidates.push(since + self.config.retry_horizon());
        }
        candidates.into_iter().min()
    }

    fn retry_pending(&mut self, now: DateTime<Utc>, events: &mut Vec<LinkEvent>) {
        let timeout = self.config.timeout();
        let max_retries = self.config.max_retries;
        let expired: Vec<u64> = self
            .state
            .pending_messages
            .iter()
            .filter(|(_, pending)| now - pending.last_sent_at >= timeout)
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        for sequence_number in expired {
            let Some(pending) = self.state.pending_messages.get_mut(&sequence_number) else {
                continue;
            };
            if pending.attempt_count <= max_retries {
                pending.attempt_count += 1;
                pending.last_sent_at = now;
                let frame = pending.frame.clone();
                debug!(sequence_number, attempt = pending.attempt_count, "link retry");
                self.transmit(frame, now);
            } else if let Some(failed) = self.state.pending_messages.remove(&sequence_number) {
                warn!(
                    sequence_number,
                    attempts = failed.attempt_count,
                    kind = failed.message.kind.name(),
                    "link delivery failed"
                );
                events.push(LinkEvent::DeliveryFailed {
                    sequence_number,
                    attempts: failed.attempt_count,
                    kind: failed.message.kind,
                });
            }
        }
    }

    /// Skip a gap the sender must have given up on by now
    fn expire_gap(&mut self, now: DateTime<Utc>, events: &mut Vec<LinkEvent>) {
        let Some(since) = self.inbound.gap_since else {
            return;
        };
        if now - since < self.config.retry_horizon() {
            return;
        }
        if let Some((&first, _)) = self.inbound.buffered.first_key_value() {
            warn!(
                missing_from = self.inbound.delivered_through + 1,
                missing_to = first - 1,
                "skipping unrecoverable sequence gap"
            );
            self.inbound.delivered_through = first - 1;
        }
        self.inbound.gap_since = None;
        self.release_in_order(now, events);
    }

    fn release_in_order(&mut self, now: DateTime<Utc>, events: &mut Vec<LinkEvent>) {
        while let Some(entry) = self.inbound.buffered.first_entry() {
            if *entry.key() != self.inbound.delivered_through + 1 {
                break;
            }
            let message = entry.remove();
            self.inbound.delivered_through = message.sequence_number;
            // Whatever is still missing is a new gap with its own timer
            self.inbound.gap_since = None;
            events.push(LinkEvent::Delivered(message));
        }
        if self.inbound.buffered.is_empty() {
            self.inbound.gap_since = None;
        } else if self.inbound.gap_since.is_none() {
            self.inbound.gap_since = Some(now);
        }
    }

    fn transmit_control(&mut self, kind: MessageKind, now: DateTime<Utc>) -> Result<()> {
        let message = WatchMessage {
            sequence_number: self.watermark(),
            kind,
            sent_at: now,
        };
        let frame = message.encode()?;
        self.transmit(frame, now);
        Ok(())
    }

    fn transmit(&mut self, frame: Vec<u8>, now: DateTime<Utc>) {
        self.state.last_transmit_at = now;
        self.outbound.push_back(frame);
    }
}
