//! Periodic refresh driver for [`GameSync`].
//!
//! One worker task per `start`, shaped like a snapshot worker: it refreshes, then
//! waits for either the next tick or a command. Ticks are sequential, so a slow
//! cycle delays the next one instead of overlapping it.

use crate::{
    ledger::RemoteLedger,
    sync::GameSync,
};
use rand::Rng;
use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{
        self,
        error::TryRecvError,
    },
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Exponential backoff applied while the ledger is unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay before the next tick after `failures` consecutive unreachable cycles,
    /// never shorter than the regular interval.
    pub fn delay(&self, interval: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return interval;
        }
        let exponent = failures.saturating_sub(1).min(16);
        let backoff = self.base.saturating_mul(1 << exponent).min(self.max);
        let jitter_cap = backoff.as_millis() as u64 / 10;
        let jitter = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
        };
        interval.max(backoff + jitter)
    }
}

enum PollerCommand {
    RefreshNow,
    Shutdown,
}

struct Running {
    commands: mpsc::UnboundedSender<PollerCommand>,
    task: JoinHandle<()>,
}

pub struct PollingScheduler<L> {
    sync: Arc<GameSync<L>>,
    backoff: Backoff,
    generation: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl<L: RemoteLedger> PollingScheduler<L> {
    pub fn new(sync: Arc<GameSync<L>>, backoff: Backoff) -> Self {
        Self {
            sync,
            backoff,
            generation: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Starts polling every `interval`, replacing any worker already running. The
    /// first cycle runs immediately.
    pub fn start(&self, interval: Duration) {
        self.stop();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_worker(
            self.sync.clone(),
            interval,
            self.backoff,
            self.generation.clone(),
            generation,
            cmd_rx,
        ));
        info!(interval_ms = interval.as_millis() as u64, "polling started");
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { commands, task });
    }

    /// Stops the worker. Results of a cycle that was in flight are dropped.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { commands, task }) = running {
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = commands.send(PollerCommand::Shutdown);
            task.abort();
            info!("polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Asks the worker to run a cycle now instead of waiting for the next tick.
    /// Returns `false` when no worker is running.
    pub fn request_refresh(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| running.commands.send(PollerCommand::RefreshNow).is_ok())
    }
}

impl<L> Drop for PollingScheduler<L> {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.task.abort();
        }
    }
}

async fn poll_worker<L: RemoteLedger>(
    sync: Arc<GameSync<L>>,
    interval: Duration,
    backoff: Backoff,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<PollerCommand>,
) {
    let is_current = move || current_generation.load(Ordering::SeqCst) == generation;
    let mut failures: u32 = 0;

    loop {
        match sync.refresh_cycle_with(&is_current).await {
            None => break,
            Some(report) if report.transport_down => {
                failures = failures.saturating_add(1);
                warn!(failures, squares_error = ?report.squares_error, "ledger unreachable");
            }
            Some(report) if !report.is_clean() => {
                failures = 0;
                warn!(
                    cycle = report.cycle,
                    field_errors = ?report.field_errors,
                    squares_error = ?report.squares_error,
                    "refresh cycle partially failed"
                );
            }
            Some(report) => {
                failures = 0;
                debug!(cycle = report.cycle, "refresh cycle complete");
            }
        }

        // Requests that piled up during the cycle collapse into one follow-up cycle.
        match drain_commands(&mut cmd_rx) {
            None => break,
            Some(true) if failures == 0 => {
                debug!("refresh requested during cycle");
                continue;
            }
            Some(_) => {}
        }

        let wait = time::sleep(backoff.delay(interval, failures));
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(PollerCommand::RefreshNow) if failures == 0 => {
                        debug!("refresh requested");
                        break;
                    }
                    Some(PollerCommand::RefreshNow) => {
                        debug!(failures, "refresh request deferred while backing off")
                    }
                    Some(PollerCommand::Shutdown) | None => return,
                },
            }
        }
    }
}

/// Empties the command queue. `None` means the worker should shut down, otherwise
/// whether at least one refresh was requested.
fn drain_commands(cmd_rx: &mut mpsc::UnboundedReceiver<PollerCommand>) -> Option<bool> {
    let mut requested = false;
    loop {
        match cmd_rx.try_recv() {
            Ok(PollerCommand::RefreshNow) => requested = true,
            Ok(PollerCommand::Shutdown) | Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => return Some(requested),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        ledger::{
            LedgerCall,
            simulated::SimulatedLedger,
        },
        types::{
            Address,
            Amount,
            SquareIndex,
        },
    };

    fn admin() -> Address {
        Address::new([0x01; 20])
    }

    fn setup() -> (Arc<SimulatedLedger>, Arc<GameSync<SimulatedLedger>>) {
        let ledger = Arc::new(SimulatedLedger::new(
            admin(),
            Amount::from_ether("0.1").unwrap(),
            11_155_111,
        ));
        let sync = Arc::new(GameSync::new(ledger.clone()));
        (ledger, sync)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start__refreshes_immediately_and_on_every_tick() {
        // given
        let (ledger, sync) = setup();
        let poller = PollingScheduler::new(sync.clone(), Backoff::default());

        // when
        poller.start(Duration::from_secs(5));
        settle().await;
        let after_first = sync.snapshot().cycle;
        ledger.execute(admin(), LedgerCall::StartGame);
        time::sleep(Duration::from_secs(5)).await;
        settle().await;

        // then
        assert_eq!(after_first, 1);
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.cycle, 2);
        assert!(snapshot.game.started);
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop__discards_results_of_in_flight_cycle() {
        // given
        let (ledger, sync) = setup();
        ledger.set_read_latency(Duration::from_secs(2));
        let poller = PollingScheduler::new(sync.clone(), Backoff::default());
        poller.start(Duration::from_secs(5));
        time::sleep(Duration::from_millis(500)).await;

        // when
        poller.stop();
        time::sleep(Duration::from_secs(10)).await;

        // then
        assert_eq!(sync.snapshot().cycle, 0);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__runs_a_cycle_before_the_next_tick() {
        // given
        let (ledger, sync) = setup();
        let poller = PollingScheduler::new(sync.clone(), Backoff::default());
        poller.start(Duration::from_secs(60));
        settle().await;
        ledger.fund(Address::new([0xAA; 20]), Amount::from_ether("1").unwrap());
        ledger.execute(admin(), LedgerCall::StartGame);
        ledger.execute(Address::new([0xAA; 20]), LedgerCall::BuySquare {
            index: SquareIndex::new(7).unwrap(),
            value: Amount::from_ether("0.1").unwrap(),
        });

        // when
        assert!(poller.request_refresh());
        settle().await;

        // then
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.cycle, 2);
        assert_eq!(snapshot.derived.total_sold, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ticks__do_not_stop_the_scheduler() {
        // given
        let (ledger, sync) = setup();
        ledger.fail_next_reads(7);
        let poller = PollingScheduler::new(sync.clone(), Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(4),
        });

        // when
        poller.start(Duration::from_secs(1));
        time::sleep(Duration::from_secs(3)).await;
        settle().await;

        // then
        assert!(poller.is_running());
        assert!(sync.snapshot().cycle >= 2);
        assert_eq!(sync.snapshot().game.admin, Some(admin()));
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__requests_during_a_slow_cycle_collapse_into_one() {
        // given
        let (ledger, sync) = setup();
        ledger.set_read_latency(Duration::from_millis(100));
        let poller = PollingScheduler::new(sync.clone(), Backoff::default());
        poller.start(Duration::from_secs(3600));
        settle().await;

        // when
        for _ in 0..50 {
            assert!(poller.request_refresh());
        }
        time::sleep(Duration::from_secs(1)).await;

        // then
        assert_eq!(ledger.counters().batch_reads, 2);
        assert_eq!(sync.snapshot().cycle, 2);
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__is_deferred_while_backing_off() {
        // given
        let (ledger, sync) = setup();
        ledger.fail_next_reads(7);
        let poller = PollingScheduler::new(sync.clone(), Backoff {
            base: Duration::from_secs(30),
            max: Duration::from_secs(60),
        });
        poller.start(Duration::from_secs(1));
        settle().await;
        let reads_after_failure = ledger.counters().batch_reads;

        // when
        assert!(poller.request_refresh());
        time::sleep(Duration::from_secs(5)).await;

        // then
        assert_eq!(ledger.counters().batch_reads, reads_after_failure);
        time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(ledger.counters().batch_reads, reads_after_failure + 1);
    }

    #[test]
    fn delay__grows_exponentially_and_is_capped() {
        // given
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        let interval = Duration::from_millis(500);

        // then
        assert_eq!(backoff.delay(interval, 0), interval);
        let third = backoff.delay(interval, 3);
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_millis(4400));
        let capped = backoff.delay(interval, 30);
        assert!(capped >= Duration::from_secs(60) && capped <= Duration::from_secs(66));
    }

    #[test]
    fn delay__never_shorter_than_interval() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(200),
        };
        assert!(backoff.delay(Duration::from_secs(5), 4) >= Duration::from_secs(5));
    }
}
