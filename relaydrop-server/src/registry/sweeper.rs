//! Idle session eviction

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{SessionRegistry, SessionStatus};

/// Reason recorded on sessions evicted for inactivity
pub const IDLE_EVICTION_MESSAGE: &str = "session idle timeout";

impl SessionRegistry {
    /// Evict every session idle for longer than the idle timeout
    ///
    /// Evicted sessions become FAILED, their transports are closed and their
    /// observers receive a single completion event. Tombstones and orphaned
    /// observer lists older than the timeout are pruned in the same pass.
    ///
    /// Returns the evicted transfer codes.
    pub async fn sweep_idle(&self, now: Instant) -> Vec<String> {
        let timeout = self.inner.idle_timeout;
        let is_stale = |since: Instant| now.saturating_duration_since(since) > timeout;

        let candidates: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| is_stale(entry.last_activity))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for code in candidates {
            // Activity may have arrived since the scan
            if self
                .finish(
                    &code,
                    SessionStatus::Failed,
                    Some(IDLE_EVICTION_MESSAGE.to_string()),
                    |s| is_stale(s.last_activity),
                )
                .await
            {
                evicted.push(code);
            }
        }

        self.inner.tombstones.retain(|_, t| !is_stale(t.at));
        let sessions = &self.inner.sessions;
        self.inner
            .progress_observers
            .retain(|code, list| sessions.contains_key(code) || !is_stale(list.since));
        self.inner
            .completion_observers
            .retain(|code, list| sessions.contains_key(code) || !is_stale(list.since));

        evicted
    }
}

/// Run [`SessionRegistry::sweep_idle`] every `interval` until the task is aborted
pub fn spawn_sweeper(registry: SessionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = registry.sweep_idle(Instant::now()).await;
            if evicted.is_empty() {
                debug!(sessions = registry.len(), "idle sweep found nothing");
            } else {
                info!(count = evicted.len(), codes = ?evicted, "evicted idle sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerInfo, TransportHandle};
    use relaydrop_common::protocol::Role;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINUTE: Duration = Duration::from_secs(60);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(30 * MINUTE)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_evicted_after_timeout() {
        let registry = registry();
        registry
            .register_sender("123456", PeerInfo::default(), None, 10)
            .unwrap();
        let (handle, mut outbox) = TransportHandle::new("192.0.2.1:1000".parse().unwrap(), 8);
        let handle = Arc::new(handle);
        registry
            .attach("123456", Role::Sender, handle.clone())
            .await
            .unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        {
            let events = events.clone();
            registry.on_complete("123456", move |e| {
                assert_eq!(e.status, SessionStatus::Failed);
                assert_eq!(e.error_message.as_deref(), Some(IDLE_EVICTION_MESSAGE));
                events.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::advance(29 * MINUTE).await;
        assert!(registry.sweep_idle(Instant::now()).await.is_empty());
        assert!(registry.contains("123456"));

        tokio::time::advance(2 * MINUTE).await;
        assert_eq!(registry.sweep_idle(Instant::now()).await, vec!["123456"]);
        assert!(!registry.contains("123456"));
        assert_eq!(registry.status("123456"), Some(SessionStatus::Failed));
        assert!(!handle.is_open());
        assert!(outbox.close.try_recv().is_ok());

        // A second sweep does not evict or notify again
        assert!(registry.sweep_idle(Instant::now()).await.is_empty());
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transport_does_not_hold_up_sweep() {
        let registry = registry();
        registry
            .register_sender("313131", PeerInfo::default(), None, 10)
            .unwrap();
        registry
            .register_sender("424242", PeerInfo::default(), None, 10)
            .unwrap();

        // Full queue, outbox alive but never drained
        let (stalled, _outbox) = TransportHandle::new("192.0.2.1:1000".parse().unwrap(), 1);
        let stalled = Arc::new(stalled);
        registry
            .attach("313131", Role::Sender, stalled.clone())
            .await
            .unwrap();
        while stalled
            .try_send_control(&relaydrop_common::protocol::ControlMessage::ready("313131"))
            .is_ok()
        {}

        tokio::time::advance(31 * MINUTE).await;
        let mut evicted = tokio::time::timeout(
            Duration::from_secs(1),
            registry.sweep_idle(Instant::now()),
        )
        .await
        .expect("sweep blocked on a stalled transport");
        evicted.sort();

        assert_eq!(evicted, vec!["313131", "424242"]);
        assert!(!stalled.is_open());
        assert!(!registry.contains("424242"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_eviction() {
        let registry = registry();
        registry
            .register_sender("654321", PeerInfo::default(), None, 10)
            .unwrap();

        tokio::time::advance(20 * MINUTE).await;
        registry
            .register_receiver("654321", PeerInfo::default())
            .unwrap();

        // 31 minutes after creation, 11 after the last activity
        tokio::time::advance(11 * MINUTE).await;
        assert!(registry.sweep_idle(Instant::now()).await.is_empty());
        assert!(registry.contains("654321"));

        tokio::time::advance(20 * MINUTE).await;
        assert_eq!(registry.sweep_idle(Instant::now()).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstones_and_orphan_observers_pruned() {
        let registry = registry();
        registry
            .register_sender("111222", PeerInfo::default(), None, 1)
            .unwrap();
        registry.cancel("111222").await.unwrap();
        registry.on_progress("999999", |_| {});

        assert_eq!(registry.status("111222"), Some(SessionStatus::Cancelled));
        tokio::time::advance(31 * MINUTE).await;
        registry.sweep_idle(Instant::now()).await;

        assert_eq!(registry.status("111222"), None);
        assert!(registry.inner.progress_observers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_evicts() {
        let registry = registry();
        registry
            .register_sender("777888", PeerInfo::default(), None, 1)
            .unwrap();
        let sweeper = spawn_sweeper(registry.clone(), MINUTE);

        tokio::time::sleep(32 * MINUTE).await;
        assert!(!registry.contains("777888"));
        sweeper.abort();
    }
}
