use crate::common::Result;
use crate::core::identity::{Identity, StudentId};
use crate::service::protocol;
use crate::service::transport::MessageSink;

/// Source of the time-of-day stamps attached to sightings.
pub trait Clock {
    fn time_of_day(&self) -> String;
}

/// Local wall clock, `HH:MM:SS.ffffff` with no date.
pub struct LocalClock;

impl Clock for LocalClock {
    fn time_of_day(&self) -> String {
        chrono::Local::now().format("%H:%M:%S%.6f").to_string()
    }
}

/// Last sighting per student within the current cycle, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceRecord {
    entries: Vec<(StudentId, String)>,
}

impl AttendanceRecord {
    /// Records a sighting; a repeat keeps its position but takes the new time.
    pub fn mark(&mut self, student: &StudentId, timestamp: String) {
        match self.entries.iter_mut().find(|(known, _)| known == student) {
            Some((_, seen_at)) => *seen_at = timestamp,
            None => self.entries.push((student.clone(), timestamp)),
        }
    }

    pub fn get(&self, student: &StudentId) -> Option<&str> {
        self.entries
            .iter()
            .find(|(known, _)| known == student)
            .map(|(_, seen_at)| seen_at.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StudentId, &str)> {
        self.entries.iter().map(|(student, seen_at)| (student, seen_at.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `{"<student>": "<time>", ...}` as sent on the attendance channel.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        protocol::encode_string_map(self.iter().map(|(student, seen_at)| (student.as_str(), seen_at)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    /// Nothing identified this cycle.
    Idle,
    /// At least one known student recorded this cycle.
    Accumulating,
    /// Record handed to the attendance channel.
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped,
    Sent { students: usize, bytes: usize },
}

/// Per-cycle attendance state machine.
///
/// Nothing carries over between cycles: a student seen in consecutive frames
/// is reported every frame, and the server decides whether that is news.
pub struct AttendanceReporter<C: Clock = LocalClock> {
    clock: C,
    state: ReporterState,
    record: AttendanceRecord,
    cycle_identities: Vec<Identity>,
}

impl AttendanceReporter<LocalClock> {
    pub fn new() -> Self {
        Self::with_clock(LocalClock)
    }
}

impl Default for AttendanceReporter<LocalClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> AttendanceReporter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: ReporterState::Idle,
            record: AttendanceRecord::default(),
            cycle_identities: Vec::new(),
        }
    }

    pub fn state(&self) -> ReporterState {
        self.state
    }

    pub fn record(&self) -> &AttendanceRecord {
        &self.record
    }

    pub fn cycle_identities(&self) -> &[Identity] {
        &self.cycle_identities
    }

    /// Adds one frame's resolutions; known students get the current time.
    pub fn observe(&mut self, identities: &[Identity]) {
        for identity in identities {
            self.cycle_identities.push(identity.clone());
            if let Some(student) = identity.student() {
                self.record.mark(student, self.clock.time_of_day());
            }
        }

        if !self.record.is_empty() {
            self.state = ReporterState::Accumulating;
        }
    }

    /// Sends the record if it holds anything. The record is consumed either
    /// way; a failed send is not retried.
    pub fn flush<S: MessageSink + ?Sized>(&mut self, sink: &mut S) -> Result<FlushOutcome> {
        if self.record.is_empty() {
            self.state = ReporterState::Idle;
            return Ok(FlushOutcome::Skipped);
        }

        self.state = ReporterState::Flushing;
        let record = std::mem::take(&mut self.record);
        let sent = record.to_payload().and_then(|payload| {
            sink.send_message(&payload)?;
            Ok(payload.len())
        });
        self.state = ReporterState::Idle;

        let bytes = sent?;
        tracing::info!(
            "[SENT] {}",
            record
                .iter()
                .map(|(student, seen_at)| format!("{}@{}", student, seen_at))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(FlushOutcome::Sent { students: record.len(), bytes })
    }

    pub fn reset(&mut self) {
        self.cycle_identities.clear();
        self.record.clear();
        self.state = ReporterState::Idle;
    }

    /// Observe, flush, reset. The reset happens even when the send fails.
    pub fn complete_cycle<S: MessageSink + ?Sized>(
        &mut self,
        identities: &[Identity],
        sink: &mut S,
    ) -> Result<FlushOutcome> {
        self.observe(identities);
        let outcome = self.flush(sink);
        self.reset();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AttendanceError;
    use std::cell::Cell;

    /// Ticks one second per reading.
    struct StepClock {
        tick: Cell<u32>,
    }

    impl StepClock {
        fn new() -> Self {
            Self { tick: Cell::new(0) }
        }
    }

    impl Clock for StepClock {
        fn time_of_day(&self) -> String {
            let tick = self.tick.get() + 1;
            self.tick.set(tick);
            format!("09:00:{:02}.000000", tick)
        }
    }

    #[derive(Default)]
    struct Outbox {
        messages: Vec<Vec<u8>>,
    }

    impl MessageSink for Outbox {
        fn send_message(&mut self, payload: &[u8]) -> Result<()> {
            self.messages.push(payload.to_vec());
            Ok(())
        }
    }

    struct DeadLink;

    impl MessageSink for DeadLink {
        fn send_message(&mut self, _payload: &[u8]) -> Result<()> {
            Err(AttendanceError::Transport("connection reset".into()))
        }
    }

    fn known(id: &str) -> Identity {
        Identity::Known(StudentId::new(id).unwrap())
    }

    fn sid(id: &str) -> StudentId {
        StudentId::new(id).unwrap()
    }

    #[test]
    fn test_unknown_faces_are_not_recorded() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        reporter.observe(&[Identity::Unknown, known("1001-ABC"), Identity::Unknown]);

        assert_eq!(reporter.record().len(), 1);
        assert_eq!(reporter.cycle_identities().len(), 3);
        assert_eq!(reporter.state(), ReporterState::Accumulating);
    }

    #[test]
    fn test_only_unknown_faces_stay_idle() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        reporter.observe(&[Identity::Unknown]);
        assert_eq!(reporter.state(), ReporterState::Idle);
        assert!(reporter.record().is_empty());
    }

    #[test]
    fn test_repeat_sighting_keeps_last_timestamp() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        reporter.observe(&[known("1001-ABC"), known("2002-XYZ"), known("1001-ABC")]);

        let record = reporter.record();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get(&sid("1001-ABC")), Some("09:00:03.000000"));
        assert_eq!(record.get(&sid("2002-XYZ")), Some("09:00:02.000000"));
    }

    #[test]
    fn test_flush_sends_record_once() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        let mut outbox = Outbox::default();

        let outcome = reporter.complete_cycle(&[known("1001-ABC")], &mut outbox).unwrap();

        let expected = br#"{"1001-ABC":"09:00:01.000000"}"#;
        assert_eq!(outcome, FlushOutcome::Sent { students: 1, bytes: expected.len() });
        assert_eq!(outbox.messages, vec![expected.to_vec()]);
        assert!(reporter.record().is_empty());
        assert!(reporter.cycle_identities().is_empty());
    }

    #[test]
    fn test_empty_cycle_sends_nothing() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        let mut outbox = Outbox::default();

        assert_eq!(reporter.complete_cycle(&[], &mut outbox).unwrap(), FlushOutcome::Skipped);
        assert_eq!(
            reporter.complete_cycle(&[Identity::Unknown], &mut outbox).unwrap(),
            FlushOutcome::Skipped
        );
        assert!(outbox.messages.is_empty());
        assert_eq!(reporter.state(), ReporterState::Idle);
    }

    #[test]
    fn test_student_is_resent_every_cycle() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        let mut outbox = Outbox::default();

        reporter.complete_cycle(&[known("1001-ABC")], &mut outbox).unwrap();
        reporter.complete_cycle(&[known("1001-ABC")], &mut outbox).unwrap();

        assert_eq!(outbox.messages.len(), 2);
        assert_eq!(outbox.messages[1], br#"{"1001-ABC":"09:00:02.000000"}"#.to_vec());
    }

    #[test]
    fn test_failed_send_propagates_and_clears() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());

        let err = reporter.complete_cycle(&[known("1001-ABC")], &mut DeadLink).unwrap_err();
        assert!(matches!(err, AttendanceError::Transport(_)));
        assert!(reporter.record().is_empty());
        assert!(reporter.cycle_identities().is_empty());
        assert_eq!(reporter.state(), ReporterState::Idle);
    }

    #[test]
    fn test_flush_without_reset_keeps_cycle_identities() {
        let mut reporter = AttendanceReporter::with_clock(StepClock::new());
        let mut outbox = Outbox::default();

        reporter.observe(&[known("1001-ABC"), Identity::Unknown]);
        reporter.flush(&mut outbox).unwrap();

        assert!(reporter.record().is_empty());
        assert_eq!(reporter.cycle_identities().len(), 2);
        reporter.reset();
        assert!(reporter.cycle_identities().is_empty());
    }

    #[test]
    fn test_local_clock_format() {
        let stamp = LocalClock.time_of_day();
        // HH:MM:SS.ffffff
        assert_eq!(stamp.len(), 15, "{}", stamp);
        assert_eq!(&stamp[2..3], ":");
        assert_eq!(&stamp[5..6], ":");
        assert_eq!(&stamp[8..9], ".");
    }
}
