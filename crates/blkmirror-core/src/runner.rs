//! Background tasks driving a resource.
//!
//! Two tasks run per resource: the sender task closes idle epochs and keeps
//! the connections alive, the resync task advances resync and verify runs
//! once per tick. Both stop when the handle is stopped or dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::resource::Resource;

/// Handle to the tasks of a running resource.
pub struct ResourceRunner {
    resource: Arc<Resource>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ResourceRunner {
    /// Spawns the sender and resync tasks on the current tokio runtime.
    pub fn spawn(resource: Arc<Resource>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let cfg = resource.config();
        let sender_every = Duration::from_millis(cfg.net.ping_interval_ms.clamp(1, 1000) / 2 + 1);
        let resync_every = Duration::from_millis(cfg.resync.tick_ms.max(1));

        let sender = tokio::spawn(run_periodic(
            "sender",
            resource.clone(),
            sender_every,
            stop_rx.clone(),
            |r, now| {
                r.send_barriers();
                r.ping_tick(now);
            },
        ));
        let resync = tokio::spawn(run_periodic(
            "resync",
            resource.clone(),
            resync_every,
            stop_rx,
            |r, now| r.resync_tick(now),
        ));
        info!(resource = %resource.name(), "runner started");
        Self {
            resource,
            stop_tx,
            tasks: vec![sender, resync],
        }
    }

    /// The driven resource.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Whether any task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stops the tasks and waits for them to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(resource = %self.resource.name(), "runner stopped");
    }
}

impl Drop for ResourceRunner {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_periodic<F>(
    name: &'static str,
    resource: Arc<Resource>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
    step: F,
) where
    F: Fn(&Resource, Instant) + Send + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => step(&resource, Instant::now()),
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!(task = name, resource = %resource.name(), "task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;
    use crate::state::ReplState;

    #[tokio::test]
    async fn test_runner_starts_and_stops() {
        let cluster = SimCluster::new(2, 1024).unwrap();
        let runner = ResourceRunner::spawn(cluster.node(0).clone());
        assert!(runner.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_runner_drives_connect() {
        let cluster = SimCluster::new(2, 1024).unwrap();
        let a = ResourceRunner::spawn(cluster.node(0).clone());
        let b = ResourceRunner::spawn(cluster.node(1).clone());
        cluster.connect_all().unwrap();
        for _ in 0..50 {
            cluster.pump();
            if cluster.repl(0, 1) == ReplState::Established {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cluster.repl(0, 1), ReplState::Established);
        a.stop().await;
        b.stop().await;
    }
}
