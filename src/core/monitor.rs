/// Periodic metrics collection
///
/// Every interval, samples each running instance that has a container and publishes
/// the result on a broadcast channel keyed by instance id.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::docker::DockerManager;
use crate::core::metrics::{MetricSample, MetricsCollector};
use crate::core::registry::{InstanceRegistry, InstanceStatus};

const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsUpdate {
    pub instance_id: String,
    pub sample: MetricSample,
}

pub struct MetricsScheduler {
    docker: Arc<DockerManager>,
    registry: Arc<dyn InstanceRegistry>,
    collector: Arc<MetricsCollector>,
    console_port: u16,
    console_timeout: Duration,
    command_timeout: Duration,
    interval: Duration,
    updates: broadcast::Sender<MetricsUpdate>,
}

impl MetricsScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docker: Arc<DockerManager>,
        registry: Arc<dyn InstanceRegistry>,
        collector: Arc<MetricsCollector>,
        console_port: u16,
        console_timeout: Duration,
        command_timeout: Duration,
        interval: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            docker,
            registry,
            collector,
            console_port,
            console_timeout,
            command_timeout,
            interval,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsUpdate> {
        self.updates.subscribe()
    }

    /// Sample every running instance once; returns how many samples were taken
    pub async fn tick(&self) -> usize {
        let mut collected = 0;

        for instance in self.registry.list() {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            let Some(handle) = instance.container_id.as_deref() else {
                continue;
            };

            let host = self
                .docker
                .get_container_ip(handle)
                .await
                .unwrap_or_else(|| "localhost".to_string());
            let console = instance
                .console_target(host, self.console_port)
                .with_timeouts(self.console_timeout, Some(self.command_timeout));

            let Some(sample) = self.collector.collect(&self.docker, &instance.id, handle, &console).await
            else {
                continue;
            };

            debug!(instance = %instance.name, players = sample.online_players, "sample collected");
            collected += 1;

            // Nobody listening is fine
            let _ = self.updates.send(MetricsUpdate {
                instance_id: instance.id.clone(),
                sample,
            });
        }

        collected
    }

    /// Run `tick` every interval until the returned handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "metrics scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

/// Next update from `updates`, skipping over a lag. `None` once every sender is gone.
pub async fn next_update(updates: &mut broadcast::Receiver<MetricsUpdate>) -> Option<MetricsUpdate> {
    loop {
        match updates.recv().await {
            Ok(update) => return Some(update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "metrics subscriber fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
