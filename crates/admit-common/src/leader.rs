//! Leader tracking
//!
//! Which frontend currently hosts the slot manager. Frontends watch this to
//! re-send outstanding slot requests after a failover.

use crate::types::FrontendId;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct LeaderTracker {
    tx: Arc<watch::Sender<Option<FrontendId>>>,
}

impl LeaderTracker {
    pub fn new(initial: Option<FrontendId>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn leader(&self) -> Option<FrontendId> {
        self.tx.borrow().clone()
    }

    pub fn is_leader(&self, id: &FrontendId) -> bool {
        self.tx.borrow().as_ref() == Some(id)
    }

    /// Publish a new leader. Subscribers are woken only on an actual change.
    pub fn set_leader(&self, leader: Option<FrontendId>) {
        self.tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            tracing::info!(
                "Leader changed: {:?} -> {:?}",
                current.as_ref().map(|l| l.as_str()),
                leader.as_ref().map(|l| l.as_str())
            );
            *current = leader;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FrontendId>> {
        self.tx.subscribe()
    }
}

impl Default for LeaderTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_failover() {
        let tracker = LeaderTracker::new(Some(FrontendId::new("fe-1")));
        let mut rx = tracker.subscribe();
        assert!(tracker.is_leader(&FrontendId::new("fe-1")));

        tracker.set_leader(Some(FrontendId::new("fe-1")));
        assert!(!rx.has_changed().unwrap());

        tracker.set_leader(Some(FrontendId::new("fe-2")));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(FrontendId::new("fe-2")));
        assert!(!tracker.is_leader(&FrontendId::new("fe-1")));
    }
}
