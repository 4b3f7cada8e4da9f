//! Session aggregation: per-tick label history, rate-limited logging and
//! the end-of-session dominant emotion.

use crate::types::Emotion;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type UserId = i64;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Write-only persistence collaborator.
pub trait EmotionSink {
    fn log_emotion(&mut self, user_id: UserId, label: Emotion, confidence: f32) -> Result<(), SinkError>;
    fn save_dominant_emotion(&mut self, user_id: UserId, label: Emotion) -> Result<(), SinkError>;
}

/// Statistical mode of `history`; ties go to the label seen first.
pub fn dominant_emotion(history: &[Emotion]) -> Option<Emotion> {
    let mut counts = [0usize; 7];
    for label in history {
        counts[label.index()] += 1;
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    history.iter().copied().find(|label| counts[label.index()] == max)
}

/// Accumulates labels for one camera session.
pub struct SessionAggregator {
    sink: Box<dyn EmotionSink>,
    cooldown: Duration,
    user_id: Option<UserId>,
    history: Vec<Emotion>,
    last_persist: Option<Instant>,
    /// Set once the session verdict has been handed to the sink.
    finalized: Option<Option<Emotion>>,
}

impl SessionAggregator {
    pub fn new(sink: Box<dyn EmotionSink>, cooldown: Duration) -> Self {
        Self {
            sink,
            cooldown,
            user_id: None,
            history: Vec::new(),
            last_persist: None,
            finalized: None,
        }
    }

    /// Start a fresh session: clears history and the cooldown window.
    pub fn begin(&mut self, user_id: Option<UserId>) {
        self.user_id = user_id;
        self.history.clear();
        self.last_persist = None;
        self.finalized = None;
    }

    pub fn record(&mut self, label: Emotion) {
        self.history.push(label);
    }

    pub fn history(&self) -> &[Emotion] {
        &self.history
    }

    /// Log one detection unless another was written within the cooldown.
    ///
    /// Returns true when a write was attempted.
    pub fn maybe_persist(&mut self, user_id: UserId, label: Emotion, confidence: f32) -> bool {
        self.maybe_persist_at(Instant::now(), user_id, label, confidence)
    }

    fn maybe_persist_at(&mut self, now: Instant, user_id: UserId, label: Emotion, confidence: f32) -> bool {
        if let Some(last) = self.last_persist {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        // A failed write still consumes the window.
        self.last_persist = Some(now);
        if let Err(e) = self.sink.log_emotion(user_id, label, confidence) {
            tracing::warn!(user_id, %label, error = %e, "failed to log emotion");
        }
        true
    }

    /// Compute the session's dominant emotion and hand it to the sink.
    ///
    /// Only the first call after [`begin`](Self::begin) writes; later calls
    /// return the same verdict.
    pub fn finalize(&mut self) -> Option<Emotion> {
        if let Some(verdict) = self.finalized {
            return verdict;
        }
        let verdict = dominant_emotion(&self.history);
        self.finalized = Some(verdict);

        match (self.user_id, verdict) {
            (Some(user_id), Some(label)) => {
                tracing::info!(user_id, %label, samples = self.history.len(), "session dominant emotion");
                if let Err(e) = self.sink.save_dominant_emotion(user_id, label) {
                    tracing::warn!(user_id, %label, error = %e, "failed to save dominant emotion");
                }
            }
            (None, Some(label)) => {
                tracing::info!(%label, samples = self.history.len(), "session dominant emotion (no user)");
            }
            (_, None) => tracing::info!("session ended without any detections"),
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Record {
        Log(UserId, Emotion),
        Dominant(UserId, Emotion),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        records: Arc<Mutex<Vec<Record>>>,
    }

    impl EmotionSink for RecordingSink {
        fn log_emotion(&mut self, user_id: UserId, label: Emotion, _confidence: f32) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(Record::Log(user_id, label));
            Ok(())
        }

        fn save_dominant_emotion(&mut self, user_id: UserId, label: Emotion) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(Record::Dominant(user_id, label));
            Ok(())
        }
    }

    struct BrokenSink;

    impl EmotionSink for BrokenSink {
        fn log_emotion(&mut self, _: UserId, _: Emotion, _: f32) -> Result<(), SinkError> {
            Err(SinkError::Storage("disk full".into()))
        }

        fn save_dominant_emotion(&mut self, _: UserId, _: Emotion) -> Result<(), SinkError> {
            Err(SinkError::Storage("disk full".into()))
        }
    }

    fn aggregator(sink: &RecordingSink, cooldown_secs: u64) -> SessionAggregator {
        SessionAggregator::new(Box::new(sink.clone()), Duration::from_secs(cooldown_secs))
    }

    use Emotion::{Angry, Happy, Neutral, Sad};

    #[test]
    fn test_mode_majority() {
        assert_eq!(dominant_emotion(&[Happy, Happy, Sad, Happy]), Some(Happy));
    }

    #[test]
    fn test_mode_tie_goes_to_first_seen() {
        assert_eq!(dominant_emotion(&[Happy, Sad]), Some(Happy));
        assert_eq!(dominant_emotion(&[Sad, Happy]), Some(Sad));
        // Angry precedes Sad canonically, but Sad was seen first.
        assert_eq!(dominant_emotion(&[Sad, Angry, Angry, Sad]), Some(Sad));
    }

    #[test]
    fn test_mode_empty() {
        assert_eq!(dominant_emotion(&[]), None);
    }

    #[test]
    fn test_finalize_writes_once() {
        let sink = RecordingSink::default();
        let mut agg = aggregator(&sink, 5);
        agg.begin(Some(7));
        for label in [Happy, Happy, Sad, Happy] {
            agg.record(label);
        }
        assert_eq!(agg.finalize(), Some(Happy));
        assert_eq!(agg.finalize(), Some(Happy));
        assert_eq!(*sink.records.lock().unwrap(), vec![Record::Dominant(7, Happy)]);
    }

    #[test]
    fn test_finalize_without_user_or_history_writes_nothing() {
        let sink = RecordingSink::default();
        let mut agg = aggregator(&sink, 5);
        agg.begin(None);
        agg.record(Neutral);
        assert_eq!(agg.finalize(), Some(Neutral));

        agg.begin(Some(1));
        assert_eq!(agg.finalize(), None);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_begin_clears_history() {
        let sink = RecordingSink::default();
        let mut agg = aggregator(&sink, 5);
        agg.begin(Some(1));
        agg.record(Sad);
        agg.finalize();
        agg.begin(Some(1));
        assert!(agg.history().is_empty());
        agg.record(Happy);
        assert_eq!(agg.finalize(), Some(Happy));
    }

    #[test]
    fn test_cooldown_suppresses_burst() {
        let sink = RecordingSink::default();
        let mut agg = aggregator(&sink, 5);
        agg.begin(Some(3));
        let writes = (0..100).filter(|_| agg.maybe_persist(3, Happy, 0.9)).count();
        assert_eq!(writes, 1);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cooldown_reopens_after_window() {
        let sink = RecordingSink::default();
        let mut agg = aggregator(&sink, 5);
        let t0 = Instant::now();
        assert!(agg.maybe_persist_at(t0, 1, Happy, 0.8));
        assert!(!agg.maybe_persist_at(t0 + Duration::from_millis(4_999), 1, Sad, 0.8));
        assert!(agg.maybe_persist_at(t0 + Duration::from_secs(5), 1, Sad, 0.8));
        assert_eq!(
            *sink.records.lock().unwrap(),
            vec![Record::Log(1, Happy), Record::Log(1, Sad)]
        );
    }

    #[test]
    fn test_sink_failures_are_absorbed() {
        let mut agg = SessionAggregator::new(Box::new(BrokenSink), Duration::from_secs(5));
        agg.begin(Some(1));
        agg.record(Angry);
        assert!(agg.maybe_persist(1, Angry, 0.7));
        assert!(!agg.maybe_persist(1, Angry, 0.7));
        assert_eq!(agg.finalize(), Some(Angry));
    }
}
