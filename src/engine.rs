use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use surge_ping::{Client as PingClient, Config as PingConfig, ICMP};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, TestSpec};
use crate::models::{HostView, ProbeResult, Snapshot, Status, TestState, TestView};
use crate::probe;

/// Scheduler bookkeeping for one configured test.
struct TestSlot {
    host_index: usize,
    spec: TestSpec,
    label: String,
    state: TestState,
    in_flight: bool,
}

/// A worker's report: the result plus the cycle it was dispatched in.
struct Outcome {
    test_id: usize,
    cycle: u64,
    result: ProbeResult,
}

pub struct Monitor {
    config: Arc<MonitorConfig>,
    client_v4: PingClient,
    client_v6: Option<PingClient>,
    limiter: Arc<Semaphore>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
}

impl Monitor {
    /// Build the monitor and the receiver on which per-cycle snapshots are
    /// published. The ICMPv6 client is created only when a host needs it;
    /// all-IPv4 configs never open an AF_INET6 socket.
    pub fn new(config: MonitorConfig) -> Result<(Self, watch::Receiver<Arc<Snapshot>>)> {
        let client_v4 =
            PingClient::new(&PingConfig::default()).context("failed to create ICMPv4 client")?;
        let client_v6 = if needs_icmpv6(&config) {
            Some(
                PingClient::new(&PingConfig::builder().kind(ICMP::V6).build())
                    .context("failed to create ICMPv6 client")?,
            )
        } else {
            None
        };
        let limiter = Arc::new(Semaphore::new(config.max_concurrency));
        let initial = Snapshot {
            generated_at: Utc::now(),
            cycle: 0,
            hosts: Vec::new(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
        Ok((
            Self {
                config: Arc::new(config),
                client_v4,
                client_v6,
                limiter,
                snapshot_tx,
            },
            snapshot_rx,
        ))
    }

    /// Run the probing loop until the process is terminated.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            client_v4,
            client_v6,
            limiter,
            snapshot_tx,
        } = self;
        let probe_config = Arc::clone(&config);
        let probe_fn = move |addr: IpAddr, spec: TestSpec| {
            let client = if addr.is_ipv6() {
                client_v6.clone()
            } else {
                Some(client_v4.clone())
            };
            let config = Arc::clone(&probe_config);
            let limiter = Arc::clone(&limiter);
            async move {
                match limiter.acquire_owned().await {
                    Ok(_permit) => probe::probe(client.as_ref(), addr, &spec, &config).await,
                    Err(_) => ProbeResult::failure("worker pool closed"),
                }
            }
        };
        run_loop(config, snapshot_tx, probe_fn).await
    }
}

fn needs_icmpv6(config: &MonitorConfig) -> bool {
    config
        .hosts
        .iter()
        .any(|host| host.addr.is_ipv6() && host.tests.contains(&TestSpec::Icmp))
}

/// The scheduler proper. Each cycle dispatches one worker per test
/// (skipping tests whose previous probe has not reported yet), merges
/// results as they arrive until the cycle deadline, then publishes a
/// snapshot. A probe still running at the deadline is left to finish; its
/// late result is merged in a later cycle or discarded if a fresher one got
/// there first.
async fn run_loop<F, Fut>(
    config: Arc<MonitorConfig>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    mut probe_fn: F,
) -> Result<()>
where
    F: FnMut(IpAddr, TestSpec) -> Fut,
    Fut: Future<Output = ProbeResult> + Send + 'static,
{
    let mut tests = build_slots(&config);
    info!(
        hosts = config.hosts.len(),
        tests = tests.len(),
        workers = config.max_concurrency,
        "monitor started"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        let started = tokio::time::Instant::now();
        let deadline = started + config.interval;

        let mut outstanding = 0usize;
        for (test_id, slot) in tests.iter_mut().enumerate() {
            if slot.in_flight {
                debug!(test = %slot.label, cycle, "previous probe still running, skipping");
                continue;
            }
            slot.in_flight = true;
            outstanding += 1;

            let addr = config.hosts[slot.host_index].addr;
            let work = probe_fn(addr, slot.spec.clone());
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = work.await;
                let _ = tx.send(Outcome {
                    test_id,
                    cycle,
                    result,
                });
            });
        }

        // Merge results as they come in, until every probe dispatched this
        // cycle has reported or the cycle deadline passes.
        while outstanding > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(outcome)) => {
                    if outcome.cycle == cycle {
                        outstanding -= 1;
                    }
                    merge(&mut tests, outcome, config.slow_threshold_ms);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(cycle, outstanding, "cycle deadline reached with probes outstanding");
                    break;
                }
            }
        }
        while let Ok(outcome) = rx.try_recv() {
            merge(&mut tests, outcome, config.slow_threshold_ms);
        }

        let snapshot = build_snapshot(&config, cycle, &tests);
        let _ = snapshot_tx.send(Arc::new(snapshot));
        debug!(
            cycle,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cycle published"
        );

        // Fixed cadence from cycle start; an overrun starts the next cycle
        // immediately.
        tokio::time::sleep_until(deadline).await;
    }
}

fn build_slots(config: &MonitorConfig) -> Vec<TestSlot> {
    let mut slots = Vec::new();
    for (host_index, host) in config.hosts.iter().enumerate() {
        for spec in &host.tests {
            slots.push(TestSlot {
                host_index,
                spec: spec.clone(),
                label: format!("{} {}", host.addr, spec.label()),
                state: TestState::new(config.history_length),
                in_flight: false,
            });
        }
    }
    slots
}

fn merge(tests: &mut [TestSlot], outcome: Outcome, slow_threshold_ms: f64) {
    let slot = &mut tests[outcome.test_id];
    slot.in_flight = false;
    let was_up = slot.state.current_status().map(|s| s != Status::Down);
    match slot.state.apply(outcome.cycle, &outcome.result, slow_threshold_ms) {
        Some(status) => {
            let is_up = status != Status::Down;
            match was_up {
                Some(old) if old != is_up => {
                    if is_up {
                        warn!(test = %slot.label, "recovered: {}", slot.state.message);
                    } else {
                        error!(test = %slot.label, "went down: {}", slot.state.message);
                    }
                }
                None if !is_up => {
                    error!(test = %slot.label, "down: {}", slot.state.message);
                }
                _ => {}
            }
        }
        None => {
            debug!(test = %slot.label, cycle = outcome.cycle, "discarded stale result");
        }
    }
}

fn build_snapshot(config: &MonitorConfig, cycle: u64, tests: &[TestSlot]) -> Snapshot {
    let hosts = config
        .hosts
        .iter()
        .enumerate()
        .map(|(host_index, host)| HostView {
            addr: host.addr,
            description: host.description.clone(),
            tests: tests
                .iter()
                .filter(|slot| slot.host_index == host_index)
                .map(|slot| TestView {
                    label: slot.spec.label(),
                    status: slot.state.current_status(),
                    latency_ms: slot.state.latency_ms,
                    history: slot.state.ordered_history(),
                    last_up: slot.state.last_up,
                })
                .collect(),
        })
        .collect();
    Snapshot {
        generated_at: Utc::now(),
        cycle,
        hosts,
    }
}
