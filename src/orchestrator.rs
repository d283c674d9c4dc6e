//! Per-device session orchestration
//!
//! [`SessionOrchestrator`] is the public entry point of the engine. It wires the
//! stages together:
//! 1. SignalWindowBuffer - ordered samples, evicted to the rolling window
//! 2. SleepStateClassifier - window → confidence-scored sleep state
//! 3. NapSessionStateMachine - classification and deadlines → transitions
//! 4. LinkChannel - transitions and summaries relayed to the peer device
//!
//! The same code runs on both devices; the [`Role`] decides which decisions are
//! made locally and which are taken from the peer. Everything is driven by the
//! caller passing `now`, so a pair of orchestrators can be exercised in one
//! process by shuttling frames between them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::SleepStateClassifier;
use crate::config::NapConfig;
use crate::error::{NapError, Result};
use crate::link::{LinkChannel, LinkEvent, LinkStatus};
use crate::session::NapSessionStateMachine;
use crate::types::{
    ClassificationResult, EndReason, NapSession, Role, SensorSample, SessionState,
    SessionTransition, SessionUpdate, SleepState,
};
use crate::window::SignalWindowBuffer;
use crate::wire::{ClassificationReport, MessageKind, WatchMessage};

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Classification {
        report: ClassificationReport,
        /// Reported by the peer rather than computed here
        from_peer: bool,
    },
    Session(SessionTransition),
    LinkDeliveryFailed {
        sequence_number: u64,
        attempts: u32,
        message_kind: &'static str,
        /// Human-readable failure, as [`NapError::LinkDeliveryFailed`] renders it
        error: String,
    },
    LinkDisconnected {
        last_heard: DateTime<Utc>,
    },
    LinkReconnected,
}

/// Nap engine for one device
#[derive(Debug)]
pub struct SessionOrchestrator {
    role: Role,
    config: NapConfig,
    buffer: SignalWindowBuffer,
    classifier: SleepStateClassifier,
    machine: NapSessionStateMachine,
    link: Option<LinkChannel>,
    events: VecDeque<OrchestratorEvent>,
    /// State and time of the last ClassificationEvent sent to the peer
    last_report: Option<(SleepState, DateTime<Utc>)>,
}

impl SessionOrchestrator {
    /// Create an orchestrator. Sensor and Controller roles open a link channel;
    /// Standalone runs without one.
    pub fn new(role: Role, config: NapConfig, now: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let link = match role {
            Role::Standalone => None,
            Role::Sensor | Role::Controller => Some(LinkChannel::new(&config.link, now)),
        };
        info!(role = role.as_str(), "nap orchestrator created");
        Ok(Self {
            role,
            buffer: SignalWindowBuffer::new(&config),
            classifier: SleepStateClassifier::new(&config),
            machine: NapSessionStateMachine::new(&config, role.authority()),
            link,
            events: VecDeque::new(),
            last_report: None,
            config,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &NapConfig {
        &self.config
    }

    /// Current or most recently finished session
    pub fn session(&self) -> Option<&NapSession> {
        self.machine.session()
    }

    pub fn link_status(&self) -> Option<LinkStatus> {
        self.link.as_ref().map(LinkChannel::status)
    }

    /// Feed one sensor sample and classify the current window.
    ///
    /// Out-of-order samples are rejected before anything else is touched.
    pub fn ingest_sample(
        &mut self,
        sample: SensorSample,
        now: DateTime<Utc>,
    ) -> Result<ClassificationResult> {
        self.buffer.ingest(sample)?;
        let result = match self.buffer.current_window() {
            Some(window) => self.classifier.classify(&window),
            None => ClassificationResult::indeterminate(sample.timestamp, 0),
        };
        debug!(
            state = ?result.state,
            confidence = result.confidence,
            samples = result.sample_count,
            "window classified"
        );

        self.events.push_back(OrchestratorEvent::Classification {
            report: ClassificationReport::from(&result),
            from_peer: false,
        });
        self.report_classification(&result, now)?;

        let transitions = self.machine.on_classification(&result, now);
        self.relay(transitions, now)?;
        Ok(result)
    }

    /// Schedule a nap and begin monitoring immediately.
    ///
    /// The requested duration (seconds) is clamped into the configured range.
    pub fn schedule_nap(&mut self, duration_secs: Option<u64>, now: DateTime<Utc>) -> Result<Uuid> {
        let scheduled = self.machine.schedule(duration_secs, now)?;
        let started = self.machine.start(now)?;
        let session_id = scheduled.session_id;
        self.last_report = None;
        self.relay(vec![scheduled, started], now)?;
        Ok(session_id)
    }

    /// Abort the active nap on the user's request
    pub fn cancel_nap(&mut self, now: DateTime<Utc>) -> Result<SessionTransition> {
        let transition = self.machine.cancel(now)?;
        self.relay(vec![transition], now)?;
        Ok(transition)
    }

    /// Handle one frame from the peer device
    pub fn receive_frame(&mut self, frame: &[u8], now: DateTime<Utc>) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            warn!("standalone orchestrator ignoring inbound frame");
            return Ok(());
        };
        let events = link.receive(frame, now)?;
        self.handle_link_events(events, now)
    }

    /// Periodic driver: link retries and liveness first, then session deadlines
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            let events = link.poll(now);
            self.handle_link_events(events, now)?;
        }
        let transitions = self.machine.tick(now);
        self.relay(transitions, now)
    }

    /// Pending notifications for the presentation layer, oldest first
    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        self.events.drain(..).collect()
    }

    /// Frames to hand to the transport, oldest first
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.link
            .as_mut()
            .map(LinkChannel::drain_outbound)
            .unwrap_or_default()
    }

    /// When `tick` should next be called
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let link = self.link.as_ref().and_then(LinkChannel::next_deadline);
        match (self.machine.next_deadline(), link) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_link_events(&mut self, events: Vec<LinkEvent>, now: DateTime<Utc>) -> Result<()> {
        for event in events {
            match event {
                LinkEvent::Delivered(message) => self.handle_message(message, now)?,
                LinkEvent::DeliveryFailed {
                    sequence_number,
                    attempts,
                    kind,
                } => {
                    let error = NapError::LinkDeliveryFailed {
                        sequence_number,
                        attempts,
                    };
                    self.events.push_back(OrchestratorEvent::LinkDeliveryFailed {
                        sequence_number,
                        attempts,
                        message_kind: kind.name(),
                        error: error.to_string(),
                    });
                    let active = self.machine.active().map(|s| s.id);
                    if kind.session_id().is_some() && kind.session_id() == active {
                        self.abort_active(EndReason::LinkDeliveryFailed, now)?;
                    }
                }
                LinkEvent::Disconnected { last_heard } => {
                    self.events
                        .push_back(OrchestratorEvent::LinkDisconnected { last_heard });
                    self.abort_active(EndReason::DataStarvation, now)?;
                }
                LinkEvent::Reconnected => {
                    self.events.push_back(OrchestratorEvent::LinkReconnected);
                }
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: WatchMessage, now: DateTime<Utc>) -> Result<()> {
        match message.kind {
            MessageKind::ClassificationEvent(report) => {
                self.events.push_back(OrchestratorEvent::Classification {
                    report,
                    from_peer: true,
                });
                // Only a peer-driven machine learns about signal activity this way
                if !self.role.authority().classification {
                    let result = ClassificationResult {
                        window_end_time: report.window_end_time,
                        state: report.state,
                        confidence: report.confidence,
                        sample_count: 0,
                    };
                    let transitions = self.machine.on_classification(&result, now);
                    self.relay(transitions, now)?;
                }
                Ok(())
            }
            MessageKind::SessionEvent(update) => self.apply_peer_update(&update, now),
            MessageKind::Heartbeat | MessageKind::Ack { .. } => Ok(()),
        }
    }

    fn apply_peer_update(&mut self, update: &SessionUpdate, now: DateTime<Utc>) -> Result<()> {
        match self.machine.apply_remote(update, now) {
            Ok(transitions) => {
                if update.new_state == SessionState::Scheduled && !transitions.is_empty() {
                    self.last_report = None;
                }
                let (from_peer, local): (Vec<_>, Vec<_>) = transitions
                    .into_iter()
                    .partition(|t| follows_from(update, t));
                self.events
                    .extend(from_peer.into_iter().map(OrchestratorEvent::Session));
                self.relay(local, now)
            }
            Err(e) => {
                warn!(
                    session_id = %update.session_id,
                    error = %e,
                    "peer is out of sync, aborting session"
                );
                self.abort_active(EndReason::PeerDesynchronized, now)
            }
        }
    }

    fn abort_active(&mut self, reason: EndReason, now: DateTime<Utc>) -> Result<()> {
        if self.machine.active().is_none() {
            return Ok(());
        }
        let transition = self.machine.abort(reason, now)?;
        self.relay(vec![transition], now)
    }

    /// Publish local transitions to the UI and the peer
    fn relay(&mut self, transitions: Vec<SessionTransition>, now: DateTime<Utc>) -> Result<()> {
        let duration_secs = self
            .machine
            .session()
            .map(|s| s.scheduled_duration_secs)
            .unwrap_or(self.config.default_nap_duration_secs);

        for transition in transitions {
            if let Some(link) = self.link.as_mut() {
                if transition.to == SessionState::Aborted {
                    link.cancel_session(transition.session_id);
                }
                let update = SessionUpdate::from_transition(&transition, duration_secs);
                link.send(MessageKind::SessionEvent(update), now)?;
            }
            self.events.push_back(OrchestratorEvent::Session(transition));
        }
        Ok(())
    }

    /// Send a ClassificationEvent on state change or once per monitoring interval
    fn report_classification(&mut self, result: &ClassificationResult, now: DateTime<Utc>) -> Result<()> {
        if !self.role.authority().classification {
            return Ok(());
        }
        let monitoring = self
            .machine
            .active()
            .is_some_and(|s| s.started_at.is_some());
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        if !monitoring {
            return Ok(());
        }

        let due = match self.last_report {
            None => true,
            Some((state, at)) => {
                state != result.state || now - at >= self.config.monitoring_interval()
            }
        };
        if due {
            link.send(
                MessageKind::ClassificationEvent(ClassificationReport::from(result)),
                now,
            )?;
            self.last_report = Some((result.state, now));
        }
        Ok(())
    }
}

/// Whether `transition` is the peer's decision itself rather than a local
/// consequence evaluated afterwards
fn follows_from(update: &SessionUpdate, transition: &SessionTransition) -> bool {
    transition.to == update.new_state
        || (update.new_state == SessionState::SleepDetected
            && transition.to == SessionState::WakeWindow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn resting(at: DateTime<Utc>) -> SensorSample {
        SensorSample::new(at, 50.0, 80.0, 0.1)
    }

    fn session_states(events: &[OrchestratorEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::Session(t) => Some(t.to),
                _ => None,
            })
            .collect()
    }

    fn sent(frames: &[Vec<u8>]) -> Vec<MessageKind> {
        frames
            .iter()
            .map(|f| WatchMessage::decode(f).unwrap().kind)
            .collect()
    }

    fn shuttle(from: &mut SessionOrchestrator, to: &mut SessionOrchestrator, now: DateTime<Utc>) {
        for frame in from.drain_outbound() {
            to.receive_frame(&frame, now).unwrap();
        }
    }

    fn exchange(a: &mut SessionOrchestrator, b: &mut SessionOrchestrator, now: DateTime<Utc>) {
        shuttle(a, b, now);
        shuttle(b, a, now);
        shuttle(a, b, now);
    }

    fn pair() -> (SessionOrchestrator, SessionOrchestrator) {
        let sensor = SessionOrchestrator::new(Role::Sensor, NapConfig::default(), t(0)).unwrap();
        let controller =
            SessionOrchestrator::new(Role::Controller, NapConfig::default(), t(0)).unwrap();
        (sensor, controller)
    }

    #[test]
    fn test_standalone_nap_ends_with_timed_wake() {
        let mut nap =
            SessionOrchestrator::new(Role::Standalone, NapConfig::default(), t(0)).unwrap();
        nap.schedule_nap(Some(90 * 60), t(0)).unwrap();
        assert_eq!(nap.session().unwrap().state, SessionState::Monitoring);

        for ms in [0, 7_500, 15_000, 22_500, 30_000] {
            let at = t(0) + Duration::milliseconds(ms);
            nap.ingest_sample(resting(at), at).unwrap();
        }
        let session = nap.session().unwrap().clone();
        assert_eq!(session.state, SessionState::WakeWindow);
        assert_eq!(session.sleep_detected_at, Some(t(30)));
        let deadline = t(30) + Duration::minutes(90);
        assert_eq!(session.wake_window_deadline, Some(deadline));
        assert_eq!(nap.next_wakeup(), Some(t(30) + Duration::seconds(120)));

        let mut now = t(30);
        while now + Duration::seconds(10) < deadline {
            now += Duration::seconds(10);
            nap.ingest_sample(resting(now), now).unwrap();
            nap.tick(now).unwrap();
        }
        assert_eq!(nap.session().unwrap().state, SessionState::WakeWindow);

        nap.tick(deadline).unwrap();
        let session = nap.session().unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.end_reason, Some(EndReason::TimedWake));
        assert_eq!(session.ended_at, Some(deadline));

        let events = nap.drain_events();
        assert_eq!(
            session_states(&events),
            vec![
                SessionState::Scheduled,
                SessionState::Monitoring,
                SessionState::SleepDetected,
                SessionState::WakeWindow,
                SessionState::Completed,
            ]
        );
        assert!(nap.drain_outbound().is_empty());
    }

    #[test]
    fn test_out_of_order_sample_is_rejected_without_side_effects() {
        let mut nap =
            SessionOrchestrator::new(Role::Standalone, NapConfig::default(), t(0)).unwrap();
        nap.schedule_nap(None, t(0)).unwrap();
        nap.ingest_sample(resting(t(10)), t(10)).unwrap();
        nap.drain_events();

        let err = nap.ingest_sample(resting(t(5)), t(11)).unwrap_err();
        assert!(matches!(err, NapError::OutOfOrderSample { .. }));
        assert!(nap.drain_events().is_empty());
        assert_eq!(nap.session().unwrap().state, SessionState::Monitoring);
    }

    #[test]
    fn test_sensor_and_controller_complete_a_nap_together() {
        let (mut sensor, mut controller) = pair();
        let id = controller.schedule_nap(Some(45 * 60), t(0)).unwrap();

        // First transmission lost; the retry gets through
        assert_eq!(controller.drain_outbound().len(), 2);
        controller.tick(t(10)).unwrap();
        exchange(&mut controller, &mut sensor, t(10));

        let mirrored = sensor.session().unwrap();
        assert_eq!(mirrored.id, id);
        assert_eq!(mirrored.state, SessionState::Monitoring);
        assert_eq!(mirrored.started_at, Some(t(0)));
        assert_eq!(mirrored.scheduled_duration_secs, 45 * 60);

        for ms in [20_000, 27_500, 35_000, 42_500, 50_000] {
            let at = t(0) + Duration::milliseconds(ms);
            sensor.ingest_sample(resting(at), at).unwrap();
        }
        assert_eq!(sensor.session().unwrap().state, SessionState::WakeWindow);
        exchange(&mut sensor, &mut controller, t(50));

        let deadline = t(50) + Duration::minutes(45);
        assert_eq!(controller.session().unwrap().state, SessionState::WakeWindow);
        assert_eq!(
            controller.session().unwrap().wake_window_deadline,
            Some(deadline)
        );
        assert!(controller.drain_events().iter().any(|e| matches!(
            e,
            OrchestratorEvent::Classification {
                from_peer: true,
                ..
            }
        )));

        let mut now = t(50);
        while now + Duration::seconds(10) < deadline {
            now += Duration::seconds(10);
            sensor.ingest_sample(resting(now), now).unwrap();
            sensor.tick(now).unwrap();
            controller.tick(now).unwrap();
            exchange(&mut sensor, &mut controller, now);
        }

        controller.tick(deadline).unwrap();
        exchange(&mut controller, &mut sensor, deadline);
        for side in [&sensor, &controller] {
            let session = side.session().unwrap();
            assert_eq!(session.state, SessionState::Completed);
            assert_eq!(session.end_reason, Some(EndReason::TimedWake));
            assert_eq!(session.ended_at, Some(deadline));
        }
        assert_eq!(sensor.link_status(), Some(LinkStatus::Connected));
    }

    #[test]
    fn test_duplicate_session_event_applies_once() {
        let (mut sensor, mut controller) = pair();
        controller.schedule_nap(None, t(0)).unwrap();
        let frames = controller.drain_outbound();

        for _ in 0..2 {
            for frame in &frames {
                sensor.receive_frame(frame, t(1)).unwrap();
            }
        }
        assert_eq!(
            session_states(&sensor.drain_events()),
            vec![SessionState::Scheduled, SessionState::Monitoring]
        );
        let acks = sent(&sensor.drain_outbound());
        assert_eq!(acks.len(), 4);
        assert!(acks.iter().all(|k| matches!(k, MessageKind::Ack { .. })));
    }

    #[test]
    fn test_cancel_relays_abort_and_drops_stale_retries() {
        let (mut sensor, mut controller) = pair();
        controller.schedule_nap(None, t(0)).unwrap();
        controller.drain_outbound();

        controller.cancel_nap(t(5)).unwrap();
        let frames = controller.drain_outbound();
        let kinds = sent(&frames);
        assert_eq!(kinds.len(), 1);
        assert!(matches!(
            kinds[0],
            MessageKind::SessionEvent(SessionUpdate {
                new_state: SessionState::Aborted,
                reason: Some(EndReason::UserCancelled),
                ..
            })
        ));

        // Only the abort is still awaiting an Ack
        controller.tick(t(15)).unwrap();
        assert_eq!(controller.drain_outbound().len(), 1);

        // Sequence numbers 1 and 2 never arrive: the abort waits behind the gap,
        // then lands on a session the peer never heard of and is ignored
        for frame in &frames {
            sensor.receive_frame(frame, t(16)).unwrap();
        }
        sensor.tick(t(56)).unwrap();
        assert!(sensor.session().is_none());
        assert!(session_states(&sensor.drain_events()).is_empty());
    }

    #[test]
    fn test_classification_reported_on_change_and_interval() {
        let (mut sensor, _) = pair();
        sensor.schedule_nap(None, t(0)).unwrap();
        for secs in 1..=60 {
            sensor.ingest_sample(resting(t(secs)), t(secs)).unwrap();
        }
        let reports: Vec<_> = sent(&sensor.drain_outbound())
            .into_iter()
            .filter_map(|k| match k {
                MessageKind::ClassificationEvent(report) => Some(report),
                _ => None,
            })
            .collect();

        // t1 first report, t5 Indeterminate -> Asleep, t35 periodic summary
        let times: Vec<_> = reports.iter().map(|r| r.window_end_time).collect();
        assert_eq!(times, vec![t(1), t(5), t(35)]);
        assert_eq!(reports[0].state, SleepState::Indeterminate);
        assert_eq!(reports[1].state, SleepState::Asleep);
    }

    #[test]
    fn test_peer_invalid_transition_aborts_as_desynchronized() {
        let (mut sensor, _) = pair();
        let id = sensor.schedule_nap(None, t(0)).unwrap();
        sensor.drain_outbound();

        let mut rogue = LinkChannel::new(&NapConfig::default().link, t(0));
        rogue
            .send(
                MessageKind::SessionEvent(SessionUpdate {
                    session_id: id,
                    new_state: SessionState::Completed,
                    reason: Some(EndReason::TimedWake),
                    at: t(3),
                    scheduled_duration_secs: None,
                }),
                t(3),
            )
            .unwrap();
        for frame in rogue.drain_outbound() {
            sensor.receive_frame(&frame, t(4)).unwrap();
        }

        let session = sensor.session().unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(session.end_reason, Some(EndReason::PeerDesynchronized));
        let kinds = sent(&sensor.drain_outbound());
        assert!(kinds.iter().any(|k| matches!(
            k,
            MessageKind::SessionEvent(SessionUpdate {
                new_state: SessionState::Aborted,
                reason: Some(EndReason::PeerDesynchronized),
                ..
            })
        )));
    }

    #[test]
    fn test_undeliverable_session_event_aborts() {
        let (_, mut controller) = pair();
        controller.schedule_nap(None, t(0)).unwrap();
        for secs in [10, 20, 30] {
            controller.tick(t(secs)).unwrap();
            assert_eq!(controller.session().unwrap().state, SessionState::Monitoring);
        }
        controller.tick(t(40)).unwrap();

        let session = controller.session().unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(session.end_reason, Some(EndReason::LinkDeliveryFailed));
        let failure = controller
            .drain_events()
            .into_iter()
            .find(|e| matches!(e, OrchestratorEvent::LinkDeliveryFailed { .. }))
            .unwrap();
        assert_eq!(
            failure,
            OrchestratorEvent::LinkDeliveryFailed {
                sequence_number: 1,
                attempts: 4,
                message_kind: "session_event",
                error: "Link delivery failed for message 1 after 4 attempts".to_string(),
            }
        );
    }

    #[test]
    fn test_silent_peer_aborts_with_data_starvation() {
        let (mut sensor, mut controller) = pair();
        controller.schedule_nap(None, t(0)).unwrap();
        exchange(&mut controller, &mut sensor, t(0));

        controller.tick(t(119)).unwrap();
        assert_eq!(controller.session().unwrap().state, SessionState::Monitoring);

        controller.tick(t(120)).unwrap();
        let session = controller.session().unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(session.end_reason, Some(EndReason::DataStarvation));
        assert_eq!(controller.link_status(), Some(LinkStatus::Disconnected));

        let events = controller.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::LinkDisconnected { last_heard } if *last_heard == t(0))));
    }

    #[test]
    fn test_standalone_ignores_frames() {
        let mut nap =
            SessionOrchestrator::new(Role::Standalone, NapConfig::default(), t(0)).unwrap();
        assert!(nap.receive_frame(b"anything", t(1)).is_ok());
        assert_eq!(nap.link_status(), None);
    }
}
