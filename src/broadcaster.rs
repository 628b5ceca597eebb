// =============================================================================
// Downstream Broadcaster — fan-out of bar updates to client sessions
// =============================================================================
//
// Each client session owns a bounded queue. `publish` never waits: when a
// session's queue is full the update is dropped for that session only and
// counted, so a slow reader cannot stall aggregation.
//
// The broadcaster also knows which symbols anyone wants. The desired
// upstream set (configured defaults ∪ session demand) is published on a
// watch channel that the upstream manager follows.
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FeedError;
use crate::stats::FeedStats;
use crate::types::{BarUpdate, SeriesKey};

pub type SessionId = Uuid;

struct Session {
    interests: HashSet<SeriesKey>,
    tx: mpsc::Sender<Arc<BarUpdate>>,
}

pub struct Broadcaster {
    sessions: RwLock<HashMap<SessionId, Session>>,
    defaults: BTreeSet<String>,
    queue_depth: usize,
    symbols_tx: watch::Sender<BTreeSet<String>>,
    stats: Arc<FeedStats>,
}

impl Broadcaster {
    pub fn new(
        defaults: impl IntoIterator<Item = String>,
        queue_depth: usize,
        stats: Arc<FeedStats>,
    ) -> Self {
        let defaults: BTreeSet<String> = defaults.into_iter().collect();
        let (symbols_tx, _) = watch::channel(defaults.clone());
        Self {
            sessions: RwLock::new(HashMap::new()),
            defaults,
            queue_depth: queue_depth.max(1),
            symbols_tx,
            stats,
        }
    }

    /// Follow the set of symbols the upstream connection should carry.
    pub fn desired_symbols(&self) -> watch::Receiver<BTreeSet<String>> {
        self.symbols_tx.subscribe()
    }

    /// Open a session with an empty interest set.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<Arc<BarUpdate>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut sessions = self.sessions.write();
        sessions.insert(
            id,
            Session {
                interests: HashSet::new(),
                tx,
            },
        );
        info!(session = %id, sessions = sessions.len(), "client session registered");
        (id, rx)
    }

    /// Returns whether the interest was new.
    pub fn subscribe(&self, id: SessionId, key: SeriesKey) -> Result<bool, FeedError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| FeedError::InvalidArgument(format!("unknown session {id}")))?;
        let added = session.interests.insert(key.clone());
        if added {
            debug!(session = %id, key = %key, "session subscribed");
            self.refresh_symbols(&sessions);
        }
        Ok(added)
    }

    /// Returns whether the interest existed.
    pub fn unsubscribe(&self, id: SessionId, key: &SeriesKey) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions
            .get_mut(&id)
            .map_or(false, |session| session.interests.remove(key));
        if removed {
            debug!(session = %id, key = %key, "session unsubscribed");
            self.refresh_symbols(&sessions);
        }
        removed
    }

    /// Drop the session and all of its interests at once.
    pub fn disconnect(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        if sessions.remove(&id).is_some() {
            info!(session = %id, sessions = sessions.len(), "client session closed");
            self.refresh_symbols(&sessions);
        }
    }

    /// Hand the update to every interested session. Returns how many sessions
    /// accepted it.
    pub fn publish(&self, update: &BarUpdate) -> usize {
        let key = update.key();
        let shared = Arc::new(update.clone());
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if !session.interests.contains(&key) {
                    continue;
                }
                match session.tx.try_send(Arc::clone(&shared)) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.stats.record_client_drop();
                        warn!(session = %id, key = %key, "client queue full — update dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.write();
            for id in closed {
                sessions.remove(&id);
                debug!(session = %id, "pruned session with closed queue");
            }
            self.refresh_symbols(&sessions);
        }
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn refresh_symbols(&self, sessions: &HashMap<SessionId, Session>) {
        let mut desired = self.defaults.clone();
        for session in sessions.values() {
            desired.extend(session.interests.iter().map(|k| k.symbol.clone()));
        }
        self.symbols_tx.send_if_modified(|current| {
            if *current == desired {
                return false;
            }
            info!(symbols = ?desired, "desired upstream symbols changed");
            *current = desired;
            true
        });
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sessions", &self.session_count())
            .field("defaults", &self.defaults)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bar, Timeframe};

    fn broadcaster(depth: usize) -> Broadcaster {
        Broadcaster::new(["MNQ".to_string()], depth, Arc::new(FeedStats::new()))
    }

    fn update(symbol: &str, timeframe: Timeframe, time: i64) -> BarUpdate {
        BarUpdate {
            symbol: symbol.into(),
            timeframe,
            bar: Bar::new(time, 1.0, 1.0, 1.0, 1.0, 1.0),
            is_final: false,
        }
    }

    fn symbols(rx: &watch::Receiver<BTreeSet<String>>) -> Vec<String> {
        rx.borrow().iter().cloned().collect()
    }

    #[test]
    fn only_interested_sessions_receive() {
        let hub = broadcaster(8);
        let (a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        hub.subscribe(a, SeriesKey::new("MNQ", Timeframe::M5)).unwrap();

        assert_eq!(hub.publish(&update("MNQ", Timeframe::M5, 0)), 1);
        assert_eq!(hub.publish(&update("MNQ", Timeframe::M15, 0)), 0);

        assert_eq!(rx_a.try_recv().unwrap().timeframe, Timeframe::M5);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn slow_session_drops_without_blocking_others() {
        let hub = broadcaster(2);
        let (slow, _slow_rx) = hub.register();
        let (fast, mut fast_rx) = hub.register();
        let key = SeriesKey::new("MNQ", Timeframe::M1);
        hub.subscribe(slow, key.clone()).unwrap();
        hub.subscribe(fast, key).unwrap();

        for t in 0..5 {
            hub.publish(&update("MNQ", Timeframe::M1, t * 60));
            let got = fast_rx.try_recv().unwrap();
            assert_eq!(got.bar.time, t * 60);
        }
        assert_eq!(hub.stats.snapshot().client_messages_dropped, 3);
    }

    #[test]
    fn updates_arrive_in_publish_order() {
        let hub = broadcaster(16);
        let (id, mut rx) = hub.register();
        hub.subscribe(id, SeriesKey::new("ES", Timeframe::H1)).unwrap();
        for t in [0, 0, 3600, 7200] {
            hub.publish(&update("ES", Timeframe::H1, t));
        }
        let times: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|u| u.bar.time)
            .collect();
        assert_eq!(times, vec![0, 0, 3600, 7200]);
    }

    #[test]
    fn demand_drives_desired_symbols() {
        let hub = broadcaster(4);
        let desired = hub.desired_symbols();
        assert_eq!(symbols(&desired), vec!["MNQ"]);

        let (a, _rx_a) = hub.register();
        let (b, _rx_b) = hub.register();
        hub.subscribe(a, SeriesKey::new("ES", Timeframe::M5)).unwrap();
        hub.subscribe(b, SeriesKey::new("ES", Timeframe::D1)).unwrap();
        assert_eq!(symbols(&desired), vec!["ES", "MNQ"]);

        hub.unsubscribe(a, &SeriesKey::new("ES", Timeframe::M5));
        assert_eq!(symbols(&desired), vec!["ES", "MNQ"]);

        // The last interested session leaving shrinks the set.
        hub.disconnect(b);
        assert_eq!(symbols(&desired), vec!["MNQ"]);
        assert_eq!(hub.session_count(), 1);
    }

    #[test]
    fn defaults_survive_unsubscribe() {
        let hub = broadcaster(4);
        let desired = hub.desired_symbols();
        let (a, _rx) = hub.register();
        let key = SeriesKey::new("MNQ", Timeframe::M5);
        assert!(hub.subscribe(a, key.clone()).unwrap());
        assert!(!hub.subscribe(a, key.clone()).unwrap());
        assert!(hub.unsubscribe(a, &key));
        assert!(!hub.unsubscribe(a, &key));
        assert_eq!(symbols(&desired), vec!["MNQ"]);
    }

    #[test]
    fn closed_sessions_are_pruned_on_publish() {
        let hub = broadcaster(4);
        let (id, rx) = hub.register();
        hub.subscribe(id, SeriesKey::new("NQ", Timeframe::M5)).unwrap();
        let desired = hub.desired_symbols();
        assert_eq!(symbols(&desired), vec!["MNQ", "NQ"]);

        drop(rx);
        assert_eq!(hub.publish(&update("NQ", Timeframe::M5, 0)), 0);
        assert_eq!(hub.session_count(), 0);
        assert_eq!(symbols(&desired), vec!["MNQ"]);
    }

    #[test]
    fn unknown_session_cannot_subscribe() {
        let hub = broadcaster(4);
        let err = hub
            .subscribe(Uuid::new_v4(), SeriesKey::new("MNQ", Timeframe::M5))
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidArgument(_)));
    }
}
