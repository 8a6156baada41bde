use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::clock::offset;

/// Best-effort memory of messages this instance has already handed to the
/// broker.
///
/// If the broker accepted a send but recording it failed, the row comes back
/// after its lease expires. Within the window the dispatcher marks it sent
/// without publishing again. This narrows, but cannot close, the duplicate
/// delivery gap; consumers stay idempotent regardless.
#[derive(Debug)]
pub struct DuplicateWindow {
    window: Duration,
    seen: DashMap<Uuid, DateTime<Utc>>,
}

impl DuplicateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    pub fn record(&self, id: Uuid, sent_at: DateTime<Utc>) {
        if self.is_enabled() {
            self.seen.insert(id, sent_at);
        }
    }

    /// Whether `id` was published within the window ending at `now`.
    pub fn contains(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        self.seen
            .get(&id)
            .is_some_and(|sent_at| now <= offset(*sent_at, self.window))
    }

    /// Drop entries that have aged out.
    pub fn purge(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.seen.retain(|_, at| now <= offset(*at, window));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn remembers_ids_for_the_window() {
        let window = DuplicateWindow::new(Duration::from_secs(600));
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert!(!window.contains(id, now));
        window.record(id, now);
        window.record(id, now);
        assert_eq!(window.len(), 1);
        assert!(window.contains(id, now + ChronoDuration::minutes(9)));
        assert!(!window.contains(id, now + ChronoDuration::minutes(11)));

        window.purge(now + ChronoDuration::minutes(11));
        assert!(window.is_empty());
    }

    #[test]
    fn zero_window_records_nothing() {
        let window = DuplicateWindow::new(Duration::ZERO);
        let id = Uuid::new_v4();
        window.record(id, Utc::now());
        assert!(!window.is_enabled());
        assert!(window.is_empty());
    }
}
