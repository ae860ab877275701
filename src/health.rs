//! Per-peer liveness checking.
//!
//! [`Checker`] owns one background job per tracked peer. Each job probes
//! its peer on a fixed cadence with a GetState call and walks the peer
//! through Healthy -> Unhealthy -> Dead as failures accumulate, with
//! hysteresis: a peer survives `max_failures` failed probes as Unhealthy
//! before the next failure declares it Dead, and a single success restores
//! Healthy from anywhere.
//!
//! Transitions fan out to a [`Watcher`] on spawned tasks so a slow handler
//! never stalls probing. The Dead -> Unhealthy edge is suppressed: once a
//! peer is declared Dead only evidence of life (a successful probe or an
//! explicit Healthy) brings it back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::descriptor::{Descriptor, Health};
use crate::error::{Error, Result};
use crate::protocols::NodeRpc;

/// Configures how the checker probes peers.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Cadence of probes per peer.
    pub check_frequency: Duration,
    /// Timeout for each probe.
    pub check_timeout: Duration,
    /// Failed probes tolerated before the next failure marks the peer
    /// Dead. 0 = dead at the first failure.
    pub max_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            check_frequency: Duration::from_secs(5),
            check_timeout: Duration::from_millis(250),
            max_failures: 3,
        }
    }
}

/// Receives health updates as the checker observes peers change.
#[async_trait]
pub trait Watcher: Send + Sync + 'static {
    /// Invoked whenever the status of a peer changes. Unhealthy means the
    /// peer is suspect and should not be routed to. May be called
    /// concurrently for different peers.
    async fn health_changed(&self, peer: Descriptor, health: Health);
}

enum Command {
    Sync(HashMap<String, Descriptor>),
    SetHealth(Descriptor, Health, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// Health checker handle. Cheap to clone; the jobs live in a background
/// actor until [`Checker::close`].
pub struct Checker {
    cmd_tx: mpsc::Sender<Command>,
}

impl Clone for Checker {
    fn clone(&self) -> Self {
        Checker {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl Checker {
    /// Starts a checker probing through `rpc` and reporting to `watcher`.
    pub fn new<N: NodeRpc>(cfg: Config, rpc: Arc<N>, watcher: Arc<dyn Watcher>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let actor = CheckerActor {
            cfg,
            rpc,
            watcher,
            jobs: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Checker { cmd_tx }
    }

    /// Updates the set of peers being checked. Peers missing from `ds`
    /// stop being checked; new peers gain a probe job. Fails with
    /// [`Error::Closed`] after [`Checker::close`].
    pub async fn check_nodes(&self, ds: Vec<Descriptor>) -> Result<()> {
        let mut map = HashMap::with_capacity(ds.len());
        for d in ds {
            map.insert(descriptor_key(&d), d);
        }
        self.cmd_tx
            .send(Command::Sync(map))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Explicitly sets the health of a tracked peer and fires the watcher.
    /// Used to immediately taint a peer after a failed RPC instead of
    /// waiting for the next probe.
    pub async fn set_health(&self, d: &Descriptor, h: Health) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetHealth(d.clone(), h, tx))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Stops every job and shuts the checker down.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(tx))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}

struct CheckerActor<N: NodeRpc> {
    cfg: Config,
    rpc: Arc<N>,
    watcher: Arc<dyn Watcher>,
    jobs: HashMap<String, Job>,
}

impl<N: NodeRpc> CheckerActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Sync(ds) => self.sync(ds),
                Command::SetHealth(d, h, reply) => {
                    let result = match self.jobs.get(&descriptor_key(&d)) {
                        Some(job) => {
                            job.monitor.transition(h);
                            Ok(())
                        }
                        None => Err(Error::InvalidArgument(format!(
                            "{} is not being health-checked",
                            d.addr
                        ))),
                    };
                    let _ = reply.send(result);
                }
                Command::Close(reply) => {
                    for (_, job) in self.jobs.drain() {
                        debug!(addr = %job.monitor.peer.addr, "stopping health-tracking for node");
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn sync(&mut self, ds: HashMap<String, Descriptor>) {
        for (key, d) in &ds {
            if !self.jobs.contains_key(key) {
                debug!(addr = %d.addr, "health-tracking node");
                self.jobs.insert(
                    key.clone(),
                    Job::spawn(self.cfg, d.clone(), self.rpc.clone(), self.watcher.clone()),
                );
            }
        }
        self.jobs.retain(|key, job| {
            let keep = ds.contains_key(key);
            if !keep {
                debug!(addr = %job.monitor.peer.addr, "stopping health-tracking for node");
            }
            keep
        });
    }
}

fn descriptor_key(d: &Descriptor) -> String {
    format!("{}/{}", d.id, d.addr)
}

/// A running probe job. Dropping it (which drops `_stop`) ends the probe
/// task at its next tick.
struct Job {
    monitor: Arc<Monitor>,
    _stop: oneshot::Sender<()>,
}

impl Job {
    fn spawn<N: NodeRpc>(
        cfg: Config,
        peer: Descriptor,
        rpc: Arc<N>,
        watcher: Arc<dyn Watcher>,
    ) -> Self {
        let monitor = Arc::new(Monitor {
            cfg,
            peer,
            watcher,
            inner: Mutex::new(MonitorInner {
                health: Health::Healthy,
                failed_attempts: 0,
            }),
        });

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_monitor = monitor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.check_frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // The first tick completes immediately.
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => task_monitor.check(rpc.as_ref()).await,
                }
            }
        });

        Job {
            monitor,
            _stop: stop_tx,
        }
    }
}

/// Health bookkeeping for one peer, shared between the probe task and
/// explicit [`Checker::set_health`] calls.
struct Monitor {
    cfg: Config,
    peer: Descriptor,
    watcher: Arc<dyn Watcher>,
    inner: Mutex<MonitorInner>,
}

struct MonitorInner {
    health: Health,
    failed_attempts: u32,
}

impl Monitor {
    async fn check<N: NodeRpc>(&self, rpc: &N) {
        let probe = tokio::time::timeout(self.cfg.check_timeout, rpc.get_state(&self.peer.addr));
        let success = match probe.await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(addr = %self.peer.addr, %err, "node health check failed");
                false
            }
            Err(_) => {
                debug!(addr = %self.peer.addr, "node health check timed out");
                false
            }
        };
        self.process_check_result(success);
    }

    fn process_check_result(&self, success: bool) {
        let mut inner = self.lock();
        if success {
            self.apply(&mut inner, Health::Healthy);
        } else if inner.failed_attempts < self.cfg.max_failures {
            // Failures remain in budget: suspect, not yet dead.
            inner.failed_attempts += 1;
            self.apply(&mut inner, Health::Unhealthy);
        } else {
            self.apply(&mut inner, Health::Dead);
        }
    }

    fn transition(&self, h: Health) {
        let mut inner = self.lock();
        self.apply(&mut inner, h);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().expect("health monitor mutex poisoned")
    }

    fn apply(&self, inner: &mut MonitorInner, h: Health) {
        // Ignore a matching state and the one invalid edge: Dead may go
        // back to Healthy, never to Unhealthy.
        if inner.health == h || (inner.health == Health::Dead && h == Health::Unhealthy) {
            return;
        }

        // Reset failures on recovery so a manual Healthy doesn't leave a
        // single failure one step from Dead.
        if h == Health::Healthy {
            inner.failed_attempts = 0;
        }
        inner.health = h;

        let watcher = self.watcher.clone();
        let peer = self.peer.clone();
        // Notify in the background so checking continues unimpeded.
        tokio::spawn(async move {
            watcher.health_changed(peer, h).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::protocols::AppRequest;
    use crate::state::{Hello, State};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingWatcher {
        events: Mutex<Vec<(Descriptor, Health)>>,
    }

    impl RecordingWatcher {
        fn new() -> Arc<Self> {
            Arc::new(RecordingWatcher {
                events: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Option<Health> {
            self.events.lock().unwrap().last().map(|(_, h)| *h)
        }

        async fn wait_for(&self, h: Health) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.last() != Some(h) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("expected health to reach {h} within 5 seconds"));
        }
    }

    #[async_trait]
    impl Watcher for RecordingWatcher {
        async fn health_changed(&self, peer: Descriptor, health: Health) {
            self.events.lock().unwrap().push((peer, health));
        }
    }

    /// Fake transport whose GetState fails until `healthy_after` calls
    /// have happened.
    struct FlakyRpc {
        calls: AtomicU32,
        healthy_after: u32,
    }

    #[async_trait]
    impl NodeRpc for FlakyRpc {
        async fn join(&self, _: &str, _: Descriptor) -> Result<()> {
            unimplemented!("probe-only fake")
        }
        async fn hello(&self, _: &str, _: Hello) -> Result<()> {
            unimplemented!("probe-only fake")
        }
        async fn goodbye(&self, _: &str, _: Descriptor) -> Result<()> {
            unimplemented!("probe-only fake")
        }
        async fn get_state(&self, _: &str) -> Result<State> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.healthy_after {
                Err(Error::Unavailable("probe refused".into()))
            } else {
                Ok(State::new(
                    Descriptor::new(Id(1), "probe-target"),
                    8,
                    8,
                    32,
                    16,
                ))
            }
        }
        async fn forward(&self, _: &str, _: AppRequest) -> Result<Vec<u8>> {
            unimplemented!("probe-only fake")
        }
        async fn evict(&self, _: &str) {}
    }

    fn monitor(max_failures: u32, watcher: Arc<dyn Watcher>) -> Monitor {
        Monitor {
            cfg: Config {
                max_failures,
                ..Config::default()
            },
            peer: Descriptor::new(Id(42), "localhost:12345"),
            watcher,
            inner: Mutex::new(MonitorInner {
                health: Health::Healthy,
                failed_attempts: 0,
            }),
        }
    }

    #[tokio::test]
    async fn transition_sequence() {
        let watcher = RecordingWatcher::new();
        let m = monitor(4, watcher.clone());

        let steps: &[(bool, Health)] = &[
            (true, Health::Healthy),
            (false, Health::Unhealthy), // 1
            (false, Health::Unhealthy), // 2
            (false, Health::Unhealthy), // 3
            (false, Health::Unhealthy), // 4
            (false, Health::Dead),
            (false, Health::Dead),
            (true, Health::Healthy),
            // Failure count resets after recovery.
            (false, Health::Unhealthy),
        ];

        let mut expect = Health::Healthy;
        for (i, (success, health)) in steps.iter().enumerate() {
            m.process_check_result(*success);
            if *health != expect {
                watcher.wait_for(*health).await;
                expect = *health;
            }
            assert_eq!(m.lock().health, *health, "step {i}");
        }
    }

    #[tokio::test]
    async fn dead_to_unhealthy_is_suppressed() {
        let watcher = RecordingWatcher::new();
        let m = monitor(0, watcher.clone());

        m.process_check_result(false);
        watcher.wait_for(Health::Dead).await;

        m.transition(Health::Unhealthy);
        assert_eq!(m.lock().health, Health::Dead);

        // But Dead -> Healthy is legal.
        m.transition(Health::Healthy);
        watcher.wait_for(Health::Healthy).await;
        assert_eq!(m.lock().failed_attempts, 0);
    }

    #[tokio::test]
    async fn probe_failures_then_recovery() {
        let watcher = RecordingWatcher::new();
        let rpc = Arc::new(FlakyRpc {
            calls: AtomicU32::new(0),
            healthy_after: 2,
        });
        let checker = Checker::new(
            Config {
                check_frequency: Duration::from_millis(10),
                check_timeout: Duration::from_millis(100),
                max_failures: 5,
                },
            rpc,
            watcher.clone(),
        );

        let peer = Descriptor::new(Id(7), "peer-a");
        checker.check_nodes(vec![peer.clone()]).await.expect("sync");

        watcher.wait_for(Health::Unhealthy).await;
        watcher.wait_for(Health::Healthy).await;

        checker.close().await.expect("close");
        assert!(checker.check_nodes(vec![peer]).await.is_err());
    }

    #[tokio::test]
    async fn set_health_requires_tracking() {
        let watcher = RecordingWatcher::new();
        let rpc = Arc::new(FlakyRpc {
            calls: AtomicU32::new(0),
            healthy_after: 0,
        });
        let checker = Checker::new(Config::default(), rpc, watcher.clone());

        let tracked = Descriptor::new(Id(1), "tracked");
        let stranger = Descriptor::new(Id(2), "stranger");
        checker
            .check_nodes(vec![tracked.clone()])
            .await
            .expect("sync");

        checker
            .set_health(&tracked, Health::Unhealthy)
            .await
            .expect("tracked peer accepts health override");
        watcher.wait_for(Health::Unhealthy).await;

        assert!(checker.set_health(&stranger, Health::Dead).await.is_err());
        checker.close().await.expect("close");
    }
}
