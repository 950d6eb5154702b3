use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// One timestamped lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only event log for a phase or round.
#[derive(Debug, Default)]
pub struct Metrics {
    events: Mutex<Vec<Metric>>,
}

impl Metrics {
    pub fn measure(&self, tag: impl Into<String>) -> DateTime<Utc> {
        let timestamp = Utc::now();
        self.lock().push(Metric {
            tag: tag.into(),
            timestamp,
        });
        timestamp
    }

    pub fn events(&self) -> Vec<Metric> {
        self.lock().clone()
    }

    /// Time between the first `from` event and the first `to` event.
    pub fn elapsed(&self, from: &str, to: &str) -> Option<chrono::Duration> {
        let events = self.lock();
        let start = events.iter().find(|m| m.tag == from)?.timestamp;
        let end = events.iter().find(|m| m.tag == to)?.timestamp;
        Some(end - start)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Metric>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_between_tags() {
        let m = Metrics::default();
        m.measure("Queued");
        m.measure("Running");
        assert!(m.elapsed("Queued", "Running").unwrap() >= chrono::Duration::zero());
        assert!(m.elapsed("Queued", "Finished").is_none());
        assert_eq!(m.events().len(), 2);
    }
}
