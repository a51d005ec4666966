//! Deferred event registry
//!
//! Holds agent speech scheduled for a wall-clock moment (alarms, reminders).
//! Entries are keyed by task identity so a replayed notification never arms a
//! second timer. Once armed an entry always fires exactly once; there is no
//! cancellation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{DeferredTask, SpeechTask};

struct PendingTask {
    trigger_at: DateTime<Utc>,
    payload: SpeechTask,
    timer: JoinHandle<()>,
}

/// Pending timer-triggered speech, keyed by id
pub struct DeferredRegistry {
    pending: HashMap<String, PendingTask>,
    due: mpsc::UnboundedSender<String>,
}

impl DeferredRegistry {
    /// Create an empty registry and the receiver fired ids arrive on
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (due, rx) = mpsc::unbounded_channel();
        let registry = Self {
            pending: HashMap::new(),
            due,
        };
        (registry, rx)
    }

    /// Arm a one-shot timer for `task`
    ///
    /// Returns false, changing nothing, when the id is already pending.
    pub fn schedule(&mut self, task: DeferredTask, now: DateTime<Utc>) -> bool {
        if self.pending.contains_key(&task.id) {
            tracing::debug!(id = %task.id, "timer already pending, ignoring duplicate");
            return false;
        }

        let delay = (task.trigger_at - now).to_std().unwrap_or_default();
        let due = self.due.clone();
        let id = task.id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due.send(id);
        });

        tracing::info!(
            id = %task.id,
            trigger_at = %task.trigger_at,
            delay_ms = delay.as_millis(),
            "timer scheduled"
        );

        self.pending.insert(
            task.id,
            PendingTask {
                trigger_at: task.trigger_at,
                payload: task.payload,
                timer,
            },
        );
        true
    }

    /// Remove a fired entry and hand back its speech
    ///
    /// Returns `None` if the id is not pending, so each entry fires once.
    pub fn fire(&mut self, id: &str) -> Option<SpeechTask> {
        let entry = self.pending.remove(id)?;
        tracing::info!(id, trigger_at = %entry.trigger_at, "timer fired");
        Some(entry.payload)
    }

    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for DeferredRegistry {
    fn drop(&mut self) {
        for entry in self.pending.values() {
            entry.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    fn task(id: &str, trigger_at: DateTime<Utc>) -> DeferredTask {
        DeferredTask {
            id: id.to_string(),
            trigger_at,
            payload: SpeechTask::from_speak("Wake up".to_string(), None, None, None),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_schedules_fire_once() {
        let (mut registry, mut rx) = DeferredRegistry::new();
        let now = Utc::now();
        let trigger = now + chrono::Duration::seconds(5);

        assert!(registry.schedule(task("alarm", trigger), now));
        assert!(!registry.schedule(task("alarm", trigger), now));
        assert_eq!(registry.len(), 1);

        let start = Instant::now();
        let id = rx.recv().await.unwrap();
        assert_eq!(id, "alarm");
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(registry.fire(&id).is_some());
        assert!(registry.fire(&id).is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_trigger_fires_immediately() {
        let (mut registry, mut rx) = DeferredRegistry::new();
        let now = Utc::now();

        registry.schedule(task("late", now - chrono::Duration::seconds(30)), now);
        let start = Instant::now();
        assert_eq!(rx.recv().await.unwrap(), "late");
        assert_eq!(start.elapsed(), Duration::ZERO);

        let payload = registry.fire("late").unwrap();
        assert_eq!(payload.text_display, "Wake up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_id_can_be_rescheduled_after_firing() {
        let (mut registry, mut rx) = DeferredRegistry::new();
        let now = Utc::now();

        registry.schedule(task("daily", now), now);
        let id = rx.recv().await.unwrap();
        registry.fire(&id);
        assert!(!registry.is_pending("daily"));

        assert!(registry.schedule(task("daily", now + chrono::Duration::seconds(1)), now));
        assert!(registry.is_pending("daily"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_ids_fire_in_trigger_order() {
        let (mut registry, mut rx) = DeferredRegistry::new();
        let now = Utc::now();

        registry.schedule(task("second", now + chrono::Duration::seconds(10)), now);
        registry.schedule(task("first", now + chrono::Duration::seconds(2)), now);

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }
}
