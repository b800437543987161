/// Per-instance resource and player metrics
///
/// Each sample pairs one Docker stats reading with the player list reported by the
/// server console. Samples are kept in memory in a bounded per-instance ring buffer,
/// pruned both by count and by age; a restart loses the history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::console::ConsoleTarget;
use crate::core::docker::{ContainerStats, DockerManager};
use crate::utils::AppConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub online_players: usize,
    pub player_names: Vec<String>,
}

impl MetricSample {
    pub fn new(stats: ContainerStats, player_names: Vec<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: stats.cpu_percent,
            memory_usage: stats.memory_usage,
            memory_limit: stats.memory_limit,
            memory_percent: stats.memory_percent,
            network_rx: stats.network_rx,
            network_tx: stats.network_tx,
            online_players: player_names.len(),
            player_names,
        }
    }
}

pub struct MetricsCollector {
    capacity: usize,
    retention: Duration,
    buffers: RwLock<HashMap<String, VecDeque<MetricSample>>>,
}

impl MetricsCollector {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.metrics_capacity, config.metrics_retention())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take one sample and store it. `None` when the stats reading failed; an
    /// unreachable console only zeroes the player count.
    pub async fn collect(
        &self,
        docker: &DockerManager,
        instance_id: &str,
        handle: &str,
        console: &ConsoleTarget,
    ) -> Option<MetricSample> {
        let Some(stats) = docker.get_stats(handle).await else {
            warn!(instance = instance_id, "no stats available, skipping sample");
            return None;
        };

        let players = fetch_players(console).await;
        Some(self.record(instance_id, stats, players))
    }

    /// Build a sample stamped now and store it
    pub fn record(&self, instance_id: &str, stats: ContainerStats, players: Vec<String>) -> MetricSample {
        let sample = MetricSample::new(stats, players, Utc::now());
        self.store(instance_id, sample.clone());
        sample
    }

    /// Append, then evict from the oldest end past either bound
    pub fn store(&self, instance_id: &str, sample: MetricSample) {
        let cutoff = self.cutoff(Utc::now());
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .entry(instance_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));

        buffer.push_back(sample);
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
        while buffer.front().is_some_and(|s| s.timestamp < cutoff) {
            buffer.pop_front();
        }
    }

    pub fn get_latest(&self, instance_id: &str) -> Option<MetricSample> {
        let cutoff = self.cutoff(Utc::now());
        self.buffers
            .read()
            .get(instance_id)
            .and_then(|buffer| buffer.back())
            .filter(|sample| sample.timestamp >= cutoff)
            .cloned()
    }

    /// Up to the last `limit` samples within the retention window, oldest first
    pub fn get_recent(&self, instance_id: &str, limit: usize) -> Vec<MetricSample> {
        let cutoff = self.cutoff(Utc::now());
        let buffers = self.buffers.read();
        let Some(buffer) = buffers.get(instance_id) else {
            return Vec::new();
        };

        let fresh: Vec<&MetricSample> = buffer.iter().filter(|s| s.timestamp >= cutoff).collect();
        let skip = fresh.len().saturating_sub(limit);
        fresh.into_iter().skip(skip).cloned().collect()
    }

    /// Drop the history of a deleted instance
    pub fn forget(&self, instance_id: &str) {
        if self.buffers.write().remove(instance_id).is_some() {
            debug!(instance = instance_id, "metrics history dropped");
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.retention) {
            Ok(retention) => now - retention,
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Online player names, empty when the console cannot be reached
pub async fn fetch_players(console: &ConsoleTarget) -> Vec<String> {
    match console.online_players().await {
        Some(list) => list.names,
        None => {
            debug!(host = %console.host, "player list unavailable");
            Vec::new()
        }
    }
}
