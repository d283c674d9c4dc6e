//! Nap session state machine
//!
//! Owns the single active [`NapSession`] and moves it through
//! `Scheduled → Monitoring → SleepDetected → WakeWindow → Completed`, with
//! `Aborted` reachable from any non-terminal state. Transitions are evaluated on
//! every classification and on every periodic tick, so deadline-based moves
//! fire even when no new classification arrives.
//!
//! Terminal sessions are immutable. A new nap always gets a new session id.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NapConfig;
use crate::error::{NapError, Result};
use crate::types::{
    Authority, ClassificationResult, EndReason, NapSession, SessionState, SessionTransition,
    SessionUpdate, SleepState,
};

/// Time-based transitions the machine may be waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Due {
    SleepTimeout,
    TimedWake,
    Starvation,
}

/// Lifecycle owner for one nap at a time
#[derive(Debug, Clone)]
pub struct NapSessionStateMachine {
    config: NapConfig,
    authority: Authority,
    session: Option<NapSession>,
    /// Arrival time of the latest classification for the active session
    last_signal_at: Option<DateTime<Utc>>,
    awake_streak: u32,
}

impl NapSessionStateMachine {
    pub fn new(config: &NapConfig, authority: Authority) -> Self {
        Self {
            config: config.clone(),
            authority,
            session: None,
            last_signal_at: None,
            awake_streak: 0,
        }
    }

    /// Current session, active or finished
    pub fn session(&self) -> Option<&NapSession> {
        self.session.as_ref()
    }

    /// Current session if it has not reached a terminal state
    pub fn active(&self) -> Option<&NapSession> {
        self.session.as_ref().filter(|s| s.is_active())
    }

    /// Hand a finished session over for archiving
    pub fn take_finished(&mut self) -> Option<NapSession> {
        if self.session.as_ref().is_some_and(|s| !s.is_active()) {
            self.session.take()
        } else {
            None
        }
    }

    /// Create a new session. The requested duration is clamped into the
    /// configured range; `None` uses the default nap length.
    pub fn schedule(
        &mut self,
        requested_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition> {
        if let Some(active) = self.active() {
            return Err(NapError::SessionAlreadyActive(active.id));
        }
        let duration = self.config.clamp_nap_duration(requested_secs);
        Ok(self.create(Uuid::new_v4(), duration, now))
    }

    /// `Scheduled → Monitoring`
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<SessionTransition> {
        let session = self.active_mut()?;
        if session.state != SessionState::Scheduled {
            return Err(NapError::InvalidTransition {
                from: Some(session.state),
                to: SessionState::Monitoring,
            });
        }
        Ok(enter(session, SessionState::Monitoring, now, None))
    }

    /// Feed a classification. Deadlines are evaluated first, then the
    /// classification itself.
    pub fn on_classification(
        &mut self,
        result: &ClassificationResult,
        now: DateTime<Utc>,
    ) -> Vec<SessionTransition> {
        let mut transitions = self.evaluate_due(now);
        if self.active().is_none() {
            return transitions;
        }
        if self.active().is_some_and(|s| s.started_at.is_some()) {
            self.last_signal_at = Some(now);
        }
        if !self.authority.classification {
            return transitions;
        }

        let threshold = self.config.confidence_threshold;
        let settle = self.config.settle_period();
        let wake_window = self.config.wake_window();
        let sustained = self.config.sustained_awake_count;

        if result.state == SleepState::Awake {
            self.awake_streak += 1;
        } else {
            self.awake_streak = 0;
        }
        let awake_streak = self.awake_streak;

        let Some(session) = self.session.as_mut() else {
            return transitions;
        };
        match session.state {
            SessionState::Monitoring => {
                let settled = session
                    .started_at
                    .is_some_and(|started| now - started >= settle);
                if result.state == SleepState::Asleep && result.confidence >= threshold {
                    if settled {
                        transitions.push(enter(session, SessionState::SleepDetected, now, None));
                        transitions.push(enter(session, SessionState::WakeWindow, now, None));
                        self.awake_streak = 0;
                    } else {
                        debug!(session_id = %session.id, "asleep reading ignored during settle period");
                    }
                }
            }
            SessionState::WakeWindow => {
                let in_wake_window = session
                    .wake_window_deadline
                    .is_some_and(|deadline| now >= deadline - wake_window);
                if awake_streak >= sustained && in_wake_window {
                    transitions.push(enter(
                        session,
                        SessionState::Completed,
                        now,
                        Some(EndReason::NaturalWake),
                    ));
                }
            }
            _ => {}
        }
        transitions
    }

    /// Periodic evaluation of deadline and starvation transitions
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<SessionTransition> {
        self.evaluate_due(now)
    }

    /// `→ Aborted(UserCancelled)`
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<SessionTransition> {
        self.abort(EndReason::UserCancelled, now)
    }

    /// `→ Aborted(reason)` from any non-terminal state
    pub fn abort(&mut self, reason: EndReason, now: DateTime<Utc>) -> Result<SessionTransition> {
        let session = self.active_mut()?;
        Ok(enter(session, SessionState::Aborted, now, Some(reason)))
    }

    /// Apply a decision made by the peer. Timestamps are taken from the update.
    ///
    /// Updates for finished or unknown sessions are ignored, repeats of the
    /// current state are no-ops, and anything the transition table forbids is
    /// reported as [`NapError::InvalidTransition`].
    pub fn apply_remote(
        &mut self,
        update: &SessionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionTransition>> {
        if update.new_state == SessionState::Scheduled {
            return match &self.session {
                Some(s) if s.id == update.session_id => Ok(Vec::new()),
                Some(s) if s.is_active() => Err(NapError::InvalidTransition {
                    from: Some(s.state),
                    to: SessionState::Scheduled,
                }),
                _ => {
                    let duration = self.config.clamp_nap_duration(update.scheduled_duration_secs);
                    Ok(vec![self.create(update.session_id, duration, update.at)])
                }
            };
        }

        let Some(session) = self.session.as_mut() else {
            debug!(session_id = %update.session_id, "update for unknown session ignored");
            return Ok(Vec::new());
        };
        if session.id != update.session_id {
            if session.is_active() {
                return Err(NapError::InvalidTransition {
                    from: Some(session.state),
                    to: update.new_state,
                });
            }
            debug!(session_id = %update.session_id, "update for unknown session ignored");
            return Ok(Vec::new());
        }
        if !session.is_active() {
            debug!(
                session_id = %session.id,
                state = session.state.as_str(),
                "update for finished session ignored"
            );
            return Ok(Vec::new());
        }
        if session.state == update.new_state {
            return Ok(Vec::new());
        }
        if !session.state.can_transition_to(update.new_state) {
            warn!(
                session_id = %session.id,
                from = session.state.as_str(),
                to = update.new_state.as_str(),
                "peer requested an invalid transition"
            );
            return Err(NapError::InvalidTransition {
                from: Some(session.state),
                to: update.new_state,
            });
        }

        let mut transitions = vec![enter(session, update.new_state, update.at, update.reason)];
        if update.new_state == SessionState::SleepDetected {
            transitions.push(enter(session, SessionState::WakeWindow, update.at, None));
        }
        if update.new_state == SessionState::Monitoring {
            self.last_signal_at = None;
        }
        // Deadlines the peer's timestamps put in the past fire immediately
        transitions.extend(self.evaluate_due(now));
        Ok(transitions)
    }

    /// Earliest pending time-based transition, if any
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.next_due().map(|(at, _)| at)
    }

    fn create(&mut self, id: Uuid, duration_secs: u64, now: DateTime<Utc>) -> SessionTransition {
        let session = NapSession {
            id,
            scheduled_duration_secs: duration_secs,
            state: SessionState::Scheduled,
            scheduled_at: now,
            started_at: None,
            sleep_detected_at: None,
            wake_window_deadline: None,
            ended_at: None,
            end_reason: None,
        };
        info!(session_id = %id, duration_secs, "nap session scheduled");
        self.session = Some(session);
        self.last_signal_at = None;
        self.awake_streak = 0;
        SessionTransition {
            session_id: id,
            from: None,
            to: SessionState::Scheduled,
            at: now,
            reason: None,
        }
    }

    fn active_mut(&mut self) -> Result<&mut NapSession> {
        self.session
            .as_mut()
            .filter(|s| s.is_active())
            .ok_or(NapError::NoActiveSession)
    }

    fn next_due(&self) -> Option<(DateTime<Utc>, Due)> {
        let session = self.active()?;
        let mut due: Option<(DateTime<Utc>, Due)> = None;

        if self.authority.timing {
            let candidate = match session.state {
                SessionState::Monitoring => session
                    .started_at
                    .map(|started| (started + self.config.max_nap_duration(), Due::SleepTimeout)),
                SessionState::WakeWindow => session
                    .wake_window_deadline
                    .map(|deadline| (deadline, Due::TimedWake)),
                _ => None,
            };
            due = earliest(due, candidate);
        }

        // Silence is measured from the last signal, or from the start of
        // monitoring if nothing has arrived yet
        if self.authority.classification {
            let candidate = self
                .last_signal_at
                .or(session.started_at)
                .map(|last| (last + self.config.starvation_grace(), Due::Starvation));
            due = earliest(due, candidate);
        }
        due
    }

    fn evaluate_due(&mut self, now: DateTime<Utc>) -> Vec<SessionTransition> {
        let Some((at, due)) = self.next_due().filter(|(at, _)| *at <= now) else {
            return Vec::new();
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let transition = match due {
            Due::SleepTimeout => enter(
                session,
                SessionState::Aborted,
                at,
                Some(EndReason::TimedOutWaitingForSleep),
            ),
            Due::TimedWake => enter(session, SessionState::Completed, at, Some(EndReason::TimedWake)),
            Due::Starvation => {
                warn!(session_id = %session.id, "sensor data starvation");
                enter(session, SessionState::Aborted, at, Some(EndReason::DataStarvation))
            }
        };
        vec![transition]
    }
}

fn earliest(
    current: Option<(DateTime<Utc>, Due)>,
    candidate: Option<(DateTime<Utc>, Due)>,
) -> Option<(DateTime<Utc>, Due)> {
    match (current, candidate) {
        (Some(c), Some(n)) if n.0 < c.0 => Some(n),
        (Some(c), _) => Some(c),
        (None, n) => n,
    }
}

/// Move `session` into `to`, recording the timestamps that state owns
fn enter(
    session: &mut NapSession,
    to: SessionState,
    at: DateTime<Utc>,
    reason: Option<EndReason>,
) -> SessionTransition {
    let from = session.state;
    session.state = to;
    match to {
        SessionState::Scheduled => {}
        SessionState::Monitoring => session.started_at = Some(at),
        SessionState::SleepDetected => session.sleep_detected_at = Some(at),
        SessionState::WakeWindow => {
            let deadline = session
                .sleep_detected_at
                .map(|detected| detected + session.scheduled_duration());
            session.wake_window_deadline = deadline;
        }
        SessionState::Completed | SessionState::Aborted => {
            session.ended_at = Some(at);
            session.end_reason = reason;
        }
    }
    info!(
        session_id = %session.id,
        from = from.as_str(),
        to = to.as_str(),
        reason = ?reason,
        "nap session transition"
    );
    SessionTransition {
        session_id: session.id,
        from: Some(from),
        to,
        at,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn result(state: SleepState, confidence: f64, at: DateTime<Utc>) -> ClassificationResult {
        ClassificationResult {
            window_end_time: at,
            state,
            confidence,
            sample_count: 5,
        }
    }

    fn asleep(at: DateTime<Utc>) -> ClassificationResult {
        result(SleepState::Asleep, 0.85, at)
    }

    fn awake(at: DateTime<Utc>) -> ClassificationResult {
        result(SleepState::Awake, 0.1, at)
    }

    fn monitoring(authority: Authority) -> NapSessionStateMachine {
        monitoring_with(&NapConfig::default(), authority)
    }

    fn monitoring_with(config: &NapConfig, authority: Authority) -> NapSessionStateMachine {
        let mut machine = NapSessionStateMachine::new(config, authority);
        machine.schedule(None, t(0)).unwrap();
        machine.start(t(0)).unwrap();
        machine
    }

    /// Sparse classifications without tripping starvation
    fn patient_config() -> NapConfig {
        NapConfig {
            starvation_grace_secs: 24 * 3600,
            ..NapConfig::default()
        }
    }

    fn states(transitions: &[SessionTransition]) -> Vec<SessionState> {
        transitions.iter().map(|t| t.to).collect()
    }

    #[test]
    fn test_schedule_clamps_and_defaults_duration() {
        let mut machine = NapSessionStateMachine::new(&NapConfig::default(), Authority::FULL);
        let transition = machine.schedule(Some(60), t(0)).unwrap();
        assert_eq!(transition.from, None);
        assert_eq!(transition.to, SessionState::Scheduled);
        assert_eq!(machine.session().unwrap().scheduled_duration_secs, 600);

        machine.cancel(t(1)).unwrap();
        machine.schedule(None, t(2)).unwrap();
        assert_eq!(machine.session().unwrap().scheduled_duration_secs, 90 * 60);
    }

    #[test]
    fn test_only_one_active_session() {
        let mut machine = NapSessionStateMachine::new(&NapConfig::default(), Authority::FULL);
        let first = machine.schedule(None, t(0)).unwrap().session_id;
        assert!(matches!(
            machine.schedule(None, t(1)),
            Err(NapError::SessionAlreadyActive(id)) if id == first
        ));

        machine.cancel(t(2)).unwrap();
        let second = machine.schedule(None, t(3)).unwrap().session_id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_start_only_from_scheduled() {
        let mut machine = monitoring(Authority::FULL);
        let err = machine.start(t(1)).unwrap_err();
        assert!(matches!(
            err,
            NapError::InvalidTransition {
                from: Some(SessionState::Monitoring),
                to: SessionState::Monitoring
            }
        ));
        assert_eq!(machine.session().unwrap().started_at, Some(t(0)));
    }

    #[test]
    fn test_settle_period_guards_sleep_detection() {
        let mut machine = monitoring(Authority::FULL);
        assert!(machine.on_classification(&asleep(t(5)), t(5)).is_empty());
        assert_eq!(machine.session().unwrap().state, SessionState::Monitoring);

        let transitions = machine.on_classification(&asleep(t(25)), t(25));
        assert_eq!(
            states(&transitions),
            vec![SessionState::SleepDetected, SessionState::WakeWindow]
        );
        let session = machine.session().unwrap();
        assert_eq!(session.sleep_detected_at, Some(t(25)));
        assert_eq!(
            session.wake_window_deadline,
            Some(t(25) + Duration::minutes(90))
        );
    }

    #[test]
    fn test_low_confidence_asleep_does_not_detect_sleep() {
        let mut machine = monitoring(Authority::FULL);
        let weak = result(SleepState::Asleep, 0.6, t(60));
        assert!(machine.on_classification(&weak, t(60)).is_empty());
    }

    #[test]
    fn test_sleep_timeout_fires_exactly_at_deadline() {
        let mut machine = monitoring(Role::Controller.authority());
        let deadline = t(0) + Duration::minutes(180);
        assert_eq!(machine.next_deadline(), Some(deadline));

        assert!(machine.tick(deadline - Duration::seconds(1)).is_empty());
        assert_eq!(machine.session().unwrap().state, SessionState::Monitoring);

        let transitions = machine.tick(deadline);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, SessionState::Aborted);
        assert_eq!(
            transitions[0].reason,
            Some(EndReason::TimedOutWaitingForSleep)
        );
        assert_eq!(transitions[0].at, deadline);
        assert_eq!(machine.session().unwrap().ended_at, Some(deadline));
    }

    #[test]
    fn test_late_tick_records_deadline_not_tick_time() {
        let mut machine = monitoring(Role::Controller.authority());
        let deadline = t(0) + Duration::minutes(180);
        let transitions = machine.tick(deadline + Duration::minutes(7));
        assert_eq!(transitions[0].at, deadline);
    }

    #[test]
    fn test_timed_wake_completes_at_deadline() {
        let mut machine = monitoring(Authority::FULL);
        machine.on_classification(&asleep(t(30)), t(30));
        let deadline = t(30) + Duration::minutes(90);

        // Keep data flowing so starvation does not interfere
        let mut now = t(30);
        while now + Duration::seconds(30) < deadline {
            now += Duration::seconds(30);
            assert!(machine.on_classification(&asleep(now), now).is_empty());
        }
        let transitions = machine.tick(deadline);
        assert_eq!(transitions[0].to, SessionState::Completed);
        assert_eq!(transitions[0].reason, Some(EndReason::TimedWake));
        assert_eq!(transitions[0].at, deadline);
    }

    #[test]
    fn test_natural_wake_within_wake_window() {
        let mut machine = monitoring_with(&patient_config(), Authority::FULL);
        machine.on_classification(&asleep(t(30)), t(30));
        let deadline = t(30) + Duration::minutes(90);

        // Early waking is not a natural wake
        for i in 1..=4 {
            let at = t(30) + Duration::minutes(20) + Duration::seconds(i * 5);
            assert!(machine.on_classification(&awake(at), at).is_empty());
        }

        let start = deadline - Duration::minutes(5);
        machine.on_classification(&asleep(start), start);
        let mut last = Vec::new();
        for i in 1..=3 {
            let at = start + Duration::seconds(i * 5);
            last = machine.on_classification(&awake(at), at);
        }
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].to, SessionState::Completed);
        assert_eq!(last[0].reason, Some(EndReason::NaturalWake));
    }

    #[test]
    fn test_indeterminate_breaks_awake_streak() {
        let mut machine = monitoring_with(&patient_config(), Authority::FULL);
        machine.on_classification(&asleep(t(30)), t(30));
        let start = t(30) + Duration::minutes(85);
        machine.on_classification(&awake(start), start);
        machine.on_classification(&awake(start + Duration::seconds(5)), start + Duration::seconds(5));
        let mid = start + Duration::seconds(10);
        machine.on_classification(&result(SleepState::Indeterminate, 0.5, mid), mid);
        let end = start + Duration::seconds(15);
        assert!(machine.on_classification(&awake(end), end).is_empty());
    }

    #[test]
    fn test_data_starvation_after_grace_period() {
        let mut machine = monitoring(Authority::FULL);
        machine.on_classification(&result(SleepState::Indeterminate, 0.5, t(10)), t(10));
        assert_eq!(machine.next_deadline(), Some(t(130)));

        assert!(machine.tick(t(129)).is_empty());
        let transitions = machine.tick(t(130));
        assert_eq!(transitions[0].reason, Some(EndReason::DataStarvation));
        assert_eq!(machine.session().unwrap().state, SessionState::Aborted);
    }

    #[test]
    fn test_starvation_when_no_data_ever_arrives() {
        let mut machine = monitoring(Authority::FULL);
        assert_eq!(machine.next_deadline(), Some(t(120)));

        assert!(machine.tick(t(119)).is_empty());
        let transitions = machine.tick(t(0) + Duration::minutes(30));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].reason, Some(EndReason::DataStarvation));
        assert_eq!(transitions[0].at, t(120));
    }

    #[test]
    fn test_scheduled_session_does_not_starve() {
        let mut machine = NapSessionStateMachine::new(&NapConfig::default(), Authority::FULL);
        machine.schedule(None, t(0)).unwrap();
        assert_eq!(machine.next_deadline(), None);
        assert!(machine.tick(t(600)).is_empty());
        assert_eq!(machine.session().unwrap().state, SessionState::Scheduled);
    }

    #[test]
    fn test_terminal_session_is_immutable() {
        let mut machine = monitoring(Authority::FULL);
        machine.cancel(t(5)).unwrap();
        let snapshot = machine.session().unwrap().clone();

        assert!(machine.on_classification(&asleep(t(40)), t(40)).is_empty());
        assert!(machine.tick(t(100_000)).is_empty());
        assert!(matches!(machine.cancel(t(41)), Err(NapError::NoActiveSession)));
        assert!(matches!(machine.start(t(42)), Err(NapError::NoActiveSession)));
        assert_eq!(machine.session().unwrap(), &snapshot);
        assert_eq!(snapshot.end_reason, Some(EndReason::UserCancelled));

        let archived = machine.take_finished().unwrap();
        assert_eq!(archived.id, snapshot.id);
        assert!(machine.session().is_none());
    }

    #[test]
    fn test_authority_gates_autonomous_decisions() {
        // Controller: no sleep detection, no starvation
        let mut controller = monitoring(Role::Controller.authority());
        assert!(controller.on_classification(&asleep(t(60)), t(60)).is_empty());
        assert!(controller.tick(t(600)).is_empty());
        assert_eq!(
            controller.next_deadline(),
            Some(t(0) + Duration::minutes(180))
        );

        // Sensor: no sleep timeout
        let mut sensor = monitoring_with(&patient_config(), Role::Sensor.authority());
        assert!(sensor.tick(t(0) + Duration::minutes(181)).is_empty());
        assert_eq!(sensor.session().unwrap().state, SessionState::Monitoring);
    }

    #[test]
    fn test_apply_remote_follows_peer() {
        let mut machine = NapSessionStateMachine::new(&NapConfig::default(), Role::Sensor.authority());
        let id = Uuid::new_v4();
        let update = |state, at, reason| SessionUpdate {
            session_id: id,
            new_state: state,
            reason,
            at,
            scheduled_duration_secs: Some(45 * 60),
        };

        let created = machine
            .apply_remote(&update(SessionState::Scheduled, t(0), None), t(0))
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(machine.session().unwrap().id, id);
        assert_eq!(machine.session().unwrap().scheduled_duration_secs, 45 * 60);

        // Repeats are no-ops
        assert!(machine
            .apply_remote(&update(SessionState::Scheduled, t(0), None), t(1))
            .unwrap()
            .is_empty());

        machine
            .apply_remote(&update(SessionState::Monitoring, t(2), None), t(2))
            .unwrap();
        let transitions = machine
            .apply_remote(&update(SessionState::SleepDetected, t(40), None), t(41))
            .unwrap();
        assert_eq!(
            states(&transitions),
            vec![SessionState::SleepDetected, SessionState::WakeWindow]
        );
        assert_eq!(
            machine.session().unwrap().wake_window_deadline,
            Some(t(40) + Duration::minutes(45))
        );

        machine
            .apply_remote(
                &update(SessionState::Completed, t(3000), Some(EndReason::TimedWake)),
                t(3000),
            )
            .unwrap();
        assert_eq!(machine.session().unwrap().end_reason, Some(EndReason::TimedWake));

        // Finished sessions ignore further updates
        assert!(machine
            .apply_remote(
                &update(SessionState::Aborted, t(3001), Some(EndReason::UserCancelled)),
                t(3001)
            )
            .unwrap()
            .is_empty());
        assert_eq!(machine.session().unwrap().state, SessionState::Completed);
    }

    #[test]
    fn test_apply_remote_rejects_invalid_transition() {
        let mut machine = monitoring(Authority::FULL);
        let id = machine.session().unwrap().id;
        let err = machine
            .apply_remote(
                &SessionUpdate {
                    session_id: id,
                    new_state: SessionState::Completed,
                    reason: Some(EndReason::TimedWake),
                    at: t(10),
                    scheduled_duration_secs: None,
                },
                t(10),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NapError::InvalidTransition {
                from: Some(SessionState::Monitoring),
                to: SessionState::Completed
            }
        ));
        assert_eq!(machine.session().unwrap().state, SessionState::Monitoring);
    }
}
