//! Scheduled polling of the charger's register blocks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use foxess_charger_common::{DeviceStatus, HealthReport, Snapshot, Value};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::decoder::{DecodeError, decode};
use crate::registers::{RegisterBlock, RegisterMap};
use crate::transport::{SharedTransport, Transport, TransportError};

/// Error type for a single block read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Cycle timed out before the block was read")]
    CycleTimeout,
}

/// Phase of the poll cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollState {
    #[default]
    Idle,
    Fetching,
    Merging,
    Failed,
}

/// Overall result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every block was read.
    Complete,
    /// At least one block was read, at least one failed.
    Partial,
    /// No block was read; the previous snapshot was kept.
    Failed,
}

/// What happened during one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Start addresses of the blocks that were read and decoded.
    pub succeeded: Vec<u16>,
    /// Start address and reason of each block that failed.
    pub failed: Vec<(u16, BlockError)>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.outcome != CycleOutcome::Failed
    }
}

/// Timing settings for the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    /// Device name used in logs and the health report.
    pub device: String,
    /// Interval between scheduled cycles.
    pub interval: Duration,
    /// Bound for a whole cycle; exceeding it abandons the cycle.
    pub cycle_timeout: Duration,
}

impl PollerSettings {
    /// Settings whose cycle bound leaves room for one connect plus one
    /// transaction per block.
    pub fn new(
        device: impl Into<String>,
        interval: Duration,
        transaction_timeout: Duration,
        map: &RegisterMap,
    ) -> Self {
        let transactions = map.blocks_to_read().len() as u32 + 1;
        Self {
            device: device.into(),
            interval,
            cycle_timeout: transaction_timeout * transactions,
        }
    }
}

/// Requests an out-of-band poll cycle.
///
/// Requests made while a cycle is running coalesce into a single extra
/// cycle started right after it.
#[derive(Debug, Clone, Default)]
pub struct RefreshTrigger(Arc<Notify>);

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.notify_one();
    }

    pub async fn requested(&self) {
        self.0.notified().await;
    }
}

/// State published by the poller. Single writer, many readers.
#[derive(Debug)]
struct Published {
    snapshot: watch::Sender<Arc<Snapshot>>,
    health: watch::Sender<HealthReport>,
    state: watch::Sender<PollState>,
}

/// Periodic, single-flight poller for one charger.
///
/// Cloning yields another handle to the same poller.
pub struct Poller<T: Transport> {
    transport: SharedTransport<T>,
    map: RegisterMap,
    settings: Arc<PollerSettings>,
    published: Arc<Published>,
    refresh: RefreshTrigger,
    cycle: Arc<Mutex<()>>,
}

impl<T: Transport> Clone for Poller<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            map: self.map,
            settings: self.settings.clone(),
            published: self.published.clone(),
            refresh: self.refresh.clone(),
            cycle: self.cycle.clone(),
        }
    }
}

impl<T: Transport> Poller<T> {
    /// Create a poller. Nothing is read until a cycle runs.
    pub fn new(
        transport: SharedTransport<T>,
        map: RegisterMap,
        settings: PollerSettings,
        refresh: RefreshTrigger,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::empty()));
        let (health, _) = watch::channel(HealthReport::new(settings.device.clone()));
        let (state, _) = watch::channel(PollState::Idle);

        Self {
            transport,
            map,
            settings: Arc::new(settings),
            published: Arc::new(Published {
                snapshot,
                health,
                state,
            }),
            refresh,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// The current snapshot. Never blocks on a running cycle.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.snapshot.borrow().clone()
    }

    /// Receiver notified each time a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.published.snapshot.subscribe()
    }

    pub fn health(&self) -> HealthReport {
        self.published.health.borrow().clone()
    }

    /// True iff the last cycle read at least one block.
    pub fn is_healthy(&self) -> bool {
        self.published.health.borrow().healthy
    }

    pub fn state(&self) -> PollState {
        *self.published.state.borrow()
    }

    pub fn refresh_trigger(&self) -> RefreshTrigger {
        self.refresh.clone()
    }

    /// Run the polling loop forever.
    pub async fn run(self) {
        let device = self.settings.device.clone();
        info!(
            device = %device,
            interval_ms = self.settings.interval.as_millis() as u64,
            blocks = self.map.blocks_to_read().len(),
            "Starting charger poller"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let on_demand = tokio::select! {
                _ = ticker.tick() => false,
                _ = self.refresh.requested() => true,
            };

            if on_demand {
                debug!(device = %device, "Refresh requested");
            }

            self.poll_once().await;

            if on_demand {
                ticker.reset();
            }
        }
    }

    /// Run one cycle now, waiting for any cycle already in flight.
    pub async fn poll_once(&self) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        self.published.state.send_replace(PollState::Fetching);

        let mut draft = BTreeMap::new();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        let deadline = started + self.settings.cycle_timeout;
        self.fetch(deadline, &mut draft, &mut succeeded, &mut failed)
            .await;

        let outcome = if succeeded.is_empty() {
            CycleOutcome::Failed
        } else if failed.is_empty() {
            CycleOutcome::Complete
        } else {
            CycleOutcome::Partial
        };

        let report = CycleReport {
            outcome,
            succeeded,
            failed,
            duration: started.elapsed(),
        };

        self.publish(draft, &report);
        report
    }

    async fn fetch(
        &self,
        deadline: Instant,
        draft: &mut BTreeMap<String, Value>,
        succeeded: &mut Vec<u16>,
        failed: &mut Vec<(u16, BlockError)>,
    ) {
        let blocks = self.map.blocks_to_read();
        for (i, block) in blocks.iter().enumerate() {
            match self.read_block(block, deadline).await {
                Ok(fields) => {
                    draft.extend(fields);
                    succeeded.push(block.start);
                }
                Err(BlockError::CycleTimeout) => {
                    warn!(
                        device = %self.settings.device,
                        block = %block.label(),
                        timeout_ms = self.settings.cycle_timeout.as_millis() as u64,
                        "Poll cycle timed out, skipping remaining blocks"
                    );
                    failed.extend(
                        blocks[i..]
                            .iter()
                            .map(|b| (b.start, BlockError::CycleTimeout)),
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        device = %self.settings.device,
                        block = %block.label(),
                        error = %e,
                        "Failed to read register block"
                    );
                    failed.push((block.start, e));
                }
            }
        }
    }

    async fn read_block(
        &self,
        block: &RegisterBlock,
        deadline: Instant,
    ) -> Result<BTreeMap<String, Value>, BlockError> {
        // Lock per transaction so queued writes run between blocks.
        let mut transport = tokio::time::timeout_at(deadline, self.transport.lock())
            .await
            .map_err(|_| BlockError::CycleTimeout)?;

        let read = transport.read_holding_registers(block.start, u16::from(block.count));
        let outcome = tokio::time::timeout_at(deadline, read).await;
        let words = match outcome {
            Ok(words) => words?,
            Err(_) => {
                // The abandoned request may still be answered; drop the
                // session before the next queued transaction gets the lock.
                transport.reset();
                return Err(BlockError::CycleTimeout);
            }
        };
        drop(transport);

        Ok(decode(block, &words)?)
    }

    fn publish(&self, draft: BTreeMap<String, Value>, report: &CycleReport) {
        let now = Utc::now();
        let failed_blocks: Vec<String> = report
            .failed
            .iter()
            .map(|(start, _)| format!("0x{:04X}", start))
            .collect();
        let last_error = report.failed.first().map(|(_, e)| e.to_string());

        if report.is_success() {
            self.published.state.send_replace(PollState::Merging);
            let fields = draft.len();
            self.published
                .snapshot
                .send_replace(Arc::new(Snapshot::new(draft)));

            self.published.health.send_modify(|health| {
                health.status = match report.outcome {
                    CycleOutcome::Complete => DeviceStatus::Online,
                    _ => DeviceStatus::Degraded,
                };
                health.healthy = true;
                health.last_success = Some(now);
                health.last_cycle = Some(now);
                health.consecutive_failures = 0;
                health.cycles_total += 1;
                health.failed_blocks = failed_blocks;
                health.last_error = last_error;
            });

            debug!(
                device = %self.settings.device,
                fields,
                failed_blocks = report.failed.len(),
                duration_ms = report.duration.as_millis() as u64,
                "Published snapshot"
            );
            self.published.state.send_replace(PollState::Idle);
        } else {
            self.published.state.send_replace(PollState::Failed);

            let mut failures = 0;
            self.published.health.send_modify(|health| {
                health.status = DeviceStatus::Offline;
                health.healthy = false;
                health.last_cycle = Some(now);
                health.consecutive_failures += 1;
                health.cycles_total += 1;
                health.failed_blocks = failed_blocks;
                health.last_error = last_error.clone();
                failures = health.consecutive_failures;
            });

            error!(
                device = %self.settings.device,
                consecutive_failures = failures,
                error = last_error.as_deref().unwrap_or("no blocks configured"),
                "Poll cycle failed, keeping previous snapshot"
            );
            self.published.state.send_replace(PollState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{REG_CONFIG_BLOCK, REG_STATUS_BLOCK, READ_BLOCKS};
    use crate::gate::WriteGate;
    use crate::transport::mock::{MockTransport, Op};

    const STATUS_WORDS: [u16; 22] = [
        1, 0x0105, 0, 3, 1, 1, 550, 650, 2310, 2295, 2305, 120, 118, 122, 2550, 1, 0, 220, 14,
        320, 60, 0,
    ];

    fn poller(transport: MockTransport) -> Poller<MockTransport> {
        let map = RegisterMap::foxess();
        let settings = PollerSettings::new(
            "test",
            Duration::from_secs(3600),
            Duration::from_secs(1),
            &map,
        );
        Poller::new(
            Arc::new(Mutex::new(transport)),
            map,
            settings,
            RefreshTrigger::new(),
        )
    }

    fn healthy_device() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.set_block(REG_STATUS_BLOCK, &STATUS_WORDS);
        transport.set_block(0x1016, &[0, 42]);
        transport.set_block(0x1018, &[1, 0]);
        transport.set_block(REG_CONFIG_BLOCK, &[1, 160, 220, 0, 0, 30, 100, 0, 0, 0, 1, 10]);
        transport
    }

    #[test]
    fn test_cycle_timeout_covers_all_blocks() {
        let map = RegisterMap::foxess();
        let settings =
            PollerSettings::new("x", Duration::from_secs(5), Duration::from_secs(5), &map);
        assert_eq!(settings.cycle_timeout, Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let poller = poller(healthy_device());
        assert!(poller.snapshot().is_empty());
        assert!(!poller.is_healthy());
        assert_eq!(poller.health().status, DeviceStatus::Unknown);
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[tokio::test]
    async fn test_complete_cycle() {
        let poller = poller(healthy_device());
        let report = poller.poll_once().await;

        assert_eq!(report.outcome, CycleOutcome::Complete);
        assert_eq!(report.succeeded.len(), READ_BLOCKS.len());

        let snapshot = poller.snapshot();
        assert_eq!(snapshot.integer("status"), Some(3));
        assert_eq!(snapshot.integer("current_energy_raw"), Some(42));
        assert_eq!(snapshot.integer("total_energy_raw"), Some(65536));
        assert_eq!(snapshot.integer("work_mode"), Some(1));

        let health = poller.health();
        assert!(health.healthy);
        assert_eq!(health.status, DeviceStatus::Online);
        assert_eq!(health.cycles_total, 1);
        assert!(health.last_success.is_some());
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[tokio::test]
    async fn test_blocks_read_in_map_order() {
        let poller = poller(healthy_device());
        poller.poll_once().await;

        let transport = poller.transport.lock().await;
        let addresses: Vec<u16> = transport
            .log
            .iter()
            .filter_map(|op| match op {
                Op::Read { address, .. } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(addresses, vec![0x1000, 0x1016, 0x1018, 0x101A, 0x101C, 0x3000]);
    }

    #[tokio::test]
    async fn test_partial_failure_omits_block_fields() {
        let mut transport = healthy_device();
        transport.failing.insert(REG_CONFIG_BLOCK);
        let poller = poller(transport);

        let report = poller.poll_once().await;
        assert_eq!(report.outcome, CycleOutcome::Partial);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, REG_CONFIG_BLOCK);

        let snapshot = poller.snapshot();
        assert!(snapshot.contains("status"));
        assert!(snapshot.contains("alarm_code"));
        assert!(!snapshot.contains("work_mode"));
        assert!(!snapshot.contains("max_charging_current_raw"));

        let health = poller.health();
        assert!(poller.is_healthy());
        assert_eq!(health.status, DeviceStatus::Degraded);
        assert_eq!(health.failed_blocks, vec!["0x3000".to_string()]);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_block_clears_its_fields_next_cycle() {
        let poller = poller(healthy_device());
        poller.poll_once().await;
        assert!(poller.snapshot().contains("work_mode"));

        poller
            .transport
            .lock()
            .await
            .failing
            .insert(REG_CONFIG_BLOCK);
        poller.poll_once().await;
        assert!(!poller.snapshot().contains("work_mode"));
    }

    #[tokio::test]
    async fn test_total_failure_keeps_previous_snapshot() {
        let poller = poller(healthy_device());
        poller.poll_once().await;
        let before = poller.snapshot();

        {
            let mut transport = poller.transport.lock().await;
            for block in READ_BLOCKS {
                transport.failing.insert(block.start);
            }
        }

        let report = poller.poll_once().await;
        assert_eq!(report.outcome, CycleOutcome::Failed);

        let after = poller.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!poller.is_healthy());

        let health = poller.health();
        assert_eq!(health.status, DeviceStatus::Offline);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.failed_blocks.len(), READ_BLOCKS.len());

        // Recovery resets the failure count.
        poller.transport.lock().await.failing.clear();
        poller.poll_once().await;
        assert!(poller.is_healthy());
        assert_eq!(poller.health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cycle_timeout_resets_connection() {
        let mut transport = healthy_device();
        transport.latency = Some(Duration::from_millis(200));
        let map = RegisterMap::foxess();
        let settings = PollerSettings {
            device: "slow".to_string(),
            interval: Duration::from_secs(3600),
            cycle_timeout: Duration::from_millis(300),
        };
        let poller = Poller::new(
            Arc::new(Mutex::new(transport)),
            map,
            settings,
            RefreshTrigger::new(),
        );

        let report = poller.poll_once().await;
        assert_eq!(report.outcome, CycleOutcome::Partial);
        assert_eq!(report.succeeded, vec![REG_STATUS_BLOCK]);
        assert!(
            report
                .failed
                .iter()
                .any(|(_, e)| *e == BlockError::CycleTimeout)
        );
        assert_eq!(report.failed.len(), READ_BLOCKS.len() - 1);
        assert_eq!(poller.transport.lock().await.resets, 1);
    }

    #[tokio::test]
    async fn test_cycle_timeout_resets_before_queued_write() {
        let mut transport = healthy_device();
        transport.latency = Some(Duration::from_millis(200));
        let transport = Arc::new(Mutex::new(transport));
        let map = RegisterMap::foxess();
        let refresh = RefreshTrigger::new();
        let settings = PollerSettings {
            device: "slow".to_string(),
            interval: Duration::from_secs(3600),
            cycle_timeout: Duration::from_millis(300),
        };
        let poller = Poller::new(transport.clone(), map, settings, refresh.clone());
        let gate = WriteGate::new(transport.clone(), map, refresh);

        // The write queues behind the second block read, which the cycle
        // deadline then abandons.
        let (report, written) = tokio::join!(poller.poll_once(), async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            gate.set_switch("charging_control", true).await
        });

        assert_eq!(report.succeeded, vec![REG_STATUS_BLOCK]);
        assert_eq!(report.failed.len(), READ_BLOCKS.len() - 1);
        assert_eq!(written, Ok(1));

        let transport = transport.lock().await;
        assert_eq!(transport.resets, 1);
        assert_eq!(
            transport.log,
            vec![
                Op::Read {
                    address: REG_STATUS_BLOCK,
                    count: 22
                },
                Op::Reset,
                Op::Write {
                    address: 0x4001,
                    value: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_new_snapshot() {
        let poller = poller(healthy_device());
        let mut rx = poller.subscribe();

        poller.poll_once().await;
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.integer("device_address"), Some(1));
    }

    #[tokio::test]
    async fn test_refresh_request_runs_cycle_before_interval() {
        let poller = poller(healthy_device());
        let mut rx = poller.subscribe();
        let trigger = poller.refresh_trigger();
        let task = tokio::spawn(poller.clone().run());

        // First tick fires immediately.
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();

        trigger.request();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("refresh cycle should run well before the hourly tick")
            .unwrap();

        assert_eq!(poller.health().cycles_total, 2);
        task.abort();
    }
}
