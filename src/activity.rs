//! Push-based updates from contract events.

use crate::{
    ledger::{
        LedgerEvent,
        LedgerLog,
        RemoteLedger,
    },
    poller::PollingScheduler,
    types::{
        Address,
        SquareIndex,
        TxId,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use futures::StreamExt;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use tokio::task::JoinHandle;
use tracing::{
    debug,
    info,
    warn,
};

pub const DEFAULT_FEED_CAPACITY: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub tx: Option<TxId>,
    pub event: LedgerEvent,
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.at.format("%H:%M:%S");
        match &self.event {
            LedgerEvent::SquarePurchased { index, .. } => {
                write!(f, "[{time}] Purchased square {index}")
            }
            LedgerEvent::GameStarted => write!(f, "[{time}] Game started"),
            LedgerEvent::GameEnded {
                home_score,
                away_score,
                winner: Some(winner),
                prize,
            } => write!(
                f,
                "[{time}] Game ended {home_score}-{away_score}, {} won {prize}",
                winner.short()
            ),
            LedgerEvent::GameEnded {
                home_score,
                away_score,
                winner: None,
                ..
            } => write!(f, "[{time}] Game ended {home_score}-{away_score}, no winner"),
        }
    }
}

/// Recent contract activity for one player, newest first.
pub struct ActivityFeed {
    player: Option<Address>,
    capacity: usize,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityFeed {
    pub fn new(player: Option<Address>, capacity: usize) -> Self {
        Self {
            player,
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Keeps the player's own purchases and every round start and end. Returns
    /// whether the log was kept.
    pub fn record(&self, log: LedgerLog) -> bool {
        let relevant = match &log.event {
            LedgerEvent::SquarePurchased { player, .. } => self.player.as_ref() == Some(player),
            LedgerEvent::GameStarted | LedgerEvent::GameEnded { .. } => true,
        };
        if !relevant {
            return false;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(ActivityEntry {
            at: Utc::now(),
            tx: log.tx,
            event: log.event,
        });
        entries.truncate(self.capacity);
        true
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Squares the player bought according to the feed, newest first.
    pub fn purchased_squares(&self) -> Vec<SquareIndex> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry.event {
                LedgerEvent::SquarePurchased { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }
}

/// Follows the ledger's event stream, feeding the activity feed and asking the
/// poller for an early refresh on every event.
pub struct EventWatcher {
    task: JoinHandle<()>,
}

impl EventWatcher {
    pub fn spawn<L: RemoteLedger>(
        ledger: &L,
        feed: Arc<ActivityFeed>,
        poller: Arc<PollingScheduler<L>>,
    ) -> Self {
        let mut events = ledger.subscribe();
        let task = tokio::spawn(async move {
            info!("watching contract events");
            while let Some(item) = events.next().await {
                match item {
                    Ok(log) => {
                        debug!(event = ?log.event, "contract event");
                        feed.record(log);
                        if !poller.request_refresh() {
                            debug!("poller not running; event refresh skipped");
                        }
                    }
                    Err(err) => warn!(?err, "event stream error"),
                }
            }
            info!("event stream closed");
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
