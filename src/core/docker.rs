/// Docker integration
///
/// Creates, controls and inspects the one container behind each managed server instance.
/// Read and control operations log daemon errors and report `false`/`None`; only
/// container creation propagates errors so the caller can mark the instance as failed.

use anyhow::{Context, Result};
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::core::container_config::{build_container_config, container_name, ContainerLayout, ServerSpec};
use crate::utils::{absolute, AppConfig, ContainerState, LABEL_SERVER_ID, LABEL_SERVER_TYPE};

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub instance_id: Option<String>,
    pub server_type: Option<String>,
    pub image: String,
    pub status: String,
    pub state: ContainerState,
    pub created: i64,
    pub ports: Vec<String>,
}

/// One normalized resource sample
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
}

/// The counters `ContainerStats` is computed from
#[derive(Debug, Clone, Default)]
pub struct RawStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    /// (rx, tx) bytes per attached interface
    pub interfaces: Vec<(u64, u64)>,
}

impl From<&Stats> for RawStats {
    fn from(stats: &Stats) -> Self {
        Self {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_total: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            interfaces: stats
                .networks
                .as_ref()
                .map(|networks| networks.values().map(|n| (n.rx_bytes, n.tx_bytes)).collect())
                .unwrap_or_default(),
        }
    }
}

impl RawStats {
    pub fn normalize(&self) -> ContainerStats {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total);
        let system_delta = self.system_total.saturating_sub(self.presystem_total);

        let cpu_percent = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * self.online_cpus as f64 * 100.0
        } else {
            0.0
        };

        let memory_percent = if self.memory_limit > 0 {
            self.memory_usage as f64 / self.memory_limit as f64 * 100.0
        } else {
            0.0
        };

        let (network_rx, network_tx) = self
            .interfaces
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (r, t)| (rx + r, tx + t));

        ContainerStats {
            cpu_percent: round2(cpu_percent),
            memory_usage: self.memory_usage,
            memory_limit: self.memory_limit,
            memory_percent: round2(memory_percent),
            network_rx,
            network_tx,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 304, .. })
}

/// Address of the container on `network` only; other attachments are ignored
pub fn ip_on_network(inspect: &ContainerInspectResponse, network: &str) -> Option<String> {
    inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .and_then(|networks| networks.get(network))
        .and_then(|endpoint| endpoint.ip_address.clone())
        .filter(|ip| !ip.is_empty())
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    network: String,
    image: String,
    servers_dir: PathBuf,
    game_port: u16,
    console_port: u16,
    delete_stop_timeout: Duration,
}

impl DockerManager {
    /// Connect to the daemon named in the config (local defaults when no socket is set)
    pub fn new(config: &AppConfig) -> Result<Self> {
        let docker = match config.docker_socket.as_deref() {
            Some(socket) => {
                let path = socket.trim_start_matches("unix://");
                Docker::connect_with_unix(path, 120, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .context("Failed to connect to Docker daemon. Is Docker running?")?;

        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: &AppConfig) -> Self {
        Self {
            docker,
            network: config.network.clone(),
            image: config.image.clone(),
            servers_dir: config.servers_dir(),
            game_port: config.game_port,
            console_port: config.console_port,
            delete_stop_timeout: Duration::from_secs(config.delete_stop_timeout_secs),
        }
    }

    /// Get managed network name
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Persistent data directory mounted at /data
    pub fn data_dir(&self, instance_id: &str) -> PathBuf {
        self.servers_dir.join(instance_id).join("data")
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Create the managed bridge network unless it already exists
    pub async fn ensure_network(&self) -> Result<()> {
        match self
            .docker
            .inspect_network(&self.network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: self.network.clone(),
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create network {}", self.network))?;
                info!(network = %self.network, "created network");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to inspect network {}", self.network)),
        }
    }

    /// Create and start the container for `spec`, returning its handle
    pub async fn create_server(&self, spec: &ServerSpec) -> Result<String> {
        self.ensure_network().await?;

        let name = container_name(&spec.instance_id);
        let data_dir = self.data_dir(&spec.instance_id);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        // The daemon resolves bind mounts against its own filesystem
        let data_dir = absolute(&data_dir)?;

        let layout = ContainerLayout {
            image: &self.image,
            network: &self.network,
            data_dir: &data_dir,
            game_port: self.game_port,
            console_port: self.console_port,
        };
        let config = build_container_config(spec, &layout);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create container {}", name))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {}", name))?;

        info!(instance = %spec.instance_id, container = %name, "created container");
        Ok(created.id)
    }

    async fn inspect(&self, handle: &str) -> Option<ContainerInspectResponse> {
        match self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Some(inspect),
            Err(e) if is_not_found(&e) => {
                debug!(container = handle, "container not found");
                None
            }
            Err(e) => {
                error!(container = handle, "Failed to inspect container: {}", e);
                None
            }
        }
    }

    /// Container address on the managed network
    pub async fn get_container_ip(&self, handle: &str) -> Option<String> {
        let inspect = self.inspect(handle).await?;
        ip_on_network(&inspect, &self.network)
    }

    pub async fn container_status(&self, handle: &str) -> Option<ContainerState> {
        let inspect = self.inspect(handle).await?;
        let status = inspect.state.and_then(|s| s.status)?;
        Some(ContainerState::from(status.to_string().as_str()))
    }

    pub async fn start_server(&self, handle: &str) -> bool {
        match self
            .docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = handle, "started container");
                true
            }
            Err(e) if is_not_modified(&e) => true,
            Err(e) => {
                self.log_failure("start", handle, &e);
                false
            }
        }
    }

    /// Stop gracefully, killing after `timeout`
    pub async fn stop_server(&self, handle: &str, timeout: Duration) -> bool {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(handle, Some(options)).await {
            Ok(()) => {
                info!(container = handle, "stopped container");
                true
            }
            Err(e) if is_not_modified(&e) => true,
            Err(e) => {
                self.log_failure("stop", handle, &e);
                false
            }
        }
    }

    pub async fn restart_server(&self, handle: &str, timeout: Duration) -> bool {
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        match self.docker.restart_container(handle, Some(options)).await {
            Ok(()) => {
                info!(container = handle, "restarted container");
                true
            }
            Err(e) => {
                self.log_failure("restart", handle, &e);
                false
            }
        }
    }

    /// Stop if running, then remove. `remove_volumes` also deletes anonymous volumes.
    pub async fn delete_server(&self, handle: &str, remove_volumes: bool) -> bool {
        let Some(inspect) = self.inspect(handle).await else {
            return false;
        };

        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        if running && !self.stop_server(handle, self.delete_stop_timeout).await {
            return false;
        }

        let options = RemoveContainerOptions {
            v: remove_volumes,
            ..Default::default()
        };
        match self.docker.remove_container(handle, Some(options)).await {
            Ok(()) => {
                info!(container = handle, remove_volumes, "deleted container");
                true
            }
            Err(e) => {
                self.log_failure("delete", handle, &e);
                false
            }
        }
    }

    /// One point-in-time resource sample
    pub async fn get_stats(&self, handle: &str) -> Option<ContainerStats> {
        // Non-streaming requests wait for a second reading so precpu is populated
        let mut stream = self.docker.stats(
            handle,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        match stream.next().await {
            Some(Ok(stats)) => Some(RawStats::from(&stats).normalize()),
            Some(Err(e)) => {
                self.log_failure("read stats of", handle, &e);
                None
            }
            None => None,
        }
    }

    /// Last `tail` log lines with timestamps
    pub async fn get_logs(&self, handle: &str, tail: usize) -> Option<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(handle, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.push_str(&output.to_string()),
                Err(e) => {
                    self.log_failure("read logs of", handle, &e);
                    return None;
                }
            }
        }
        Some(logs)
    }

    /// Every container carrying the instance label, stopped ones included
    pub async fn list_managed(&self) -> Vec<ContainerInfo> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_SERVER_ID.to_string()]);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        match self.docker.list_containers(options).await {
            Ok(containers) => containers.into_iter().map(container_summary_to_info).collect(),
            Err(e) => {
                error!("Failed to list containers: {}", e);
                Vec::new()
            }
        }
    }

    fn log_failure(&self, action: &str, handle: &str, err: &DockerError) {
        if is_not_found(err) {
            debug!(container = handle, "cannot {} missing container", action);
        } else {
            error!(container = handle, "Failed to {} container: {}", action, err);
        }
    }
}

/// Convert ContainerSummary to ContainerInfo
fn container_summary_to_info(summary: ContainerSummary) -> ContainerInfo {
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let status = summary.status.clone().unwrap_or_else(|| "unknown".to_string());
    let state = summary
        .state
        .as_deref()
        .unwrap_or("unknown")
        .into();

    let label = |key: &str| summary.labels.as_ref().and_then(|l| l.get(key)).cloned();
    let instance_id = label(LABEL_SERVER_ID);
    let server_type = label(LABEL_SERVER_TYPE);

    let ports = summary
        .ports
        .as_ref()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    p.public_port.map(|pub_port| {
                        format!(
                            "{}:{}->{}",
                            p.ip.as_deref().unwrap_or("0.0.0.0"),
                            pub_port,
                            p.private_port
                        )
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        instance_id,
        server_type,
        image: summary.image.unwrap_or_else(|| "unknown".to_string()),
        status,
        state,
        created: summary.created.unwrap_or(0),
        ports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EndpointSettings, NetworkSettings};

    fn inspect_with(networks: &[(&str, &str)]) -> ContainerInspectResponse {
        let networks = networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    EndpointSettings {
                        ip_address: Some(ip.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ip_on_managed_network_only() {
        let inspect = inspect_with(&[("bridge", "172.17.0.2"), ("minecraft-network", "172.20.0.5")]);
        assert_eq!(
            ip_on_network(&inspect, "minecraft-network"),
            Some("172.20.0.5".to_string())
        );

        let detached = inspect_with(&[("bridge", "172.17.0.2")]);
        assert_eq!(ip_on_network(&detached, "minecraft-network"), None);

        let no_settings = ContainerInspectResponse::default();
        assert_eq!(ip_on_network(&no_settings, "minecraft-network"), None);

        let empty_ip = inspect_with(&[("minecraft-network", "")]);
        assert_eq!(ip_on_network(&empty_ip, "minecraft-network"), None);
    }

    #[test]
    fn test_normalize_stats() {
        let raw = RawStats {
            cpu_total: 400_000_000,
            precpu_total: 300_000_000,
            system_total: 20_000_000_000,
            presystem_total: 19_000_000_000,
            online_cpus: 4,
            memory_usage: 512 * 1024 * 1024,
            memory_limit: 2048 * 1024 * 1024,
            interfaces: vec![(1000, 200), (500, 50)],
        };

        let stats = raw.normalize();
        assert_eq!(stats.cpu_percent, 40.0);
        assert_eq!(stats.memory_percent, 25.0);
        assert_eq!(stats.network_rx, 1500);
        assert_eq!(stats.network_tx, 250);
    }

    #[test]
    fn test_normalize_guards_zero_denominators() {
        let raw = RawStats {
            cpu_total: 10,
            precpu_total: 5,
            memory_usage: 100,
            online_cpus: 2,
            ..Default::default()
        };

        let stats = raw.normalize();
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_percent, 0.0);
        assert_eq!(stats.network_rx, 0);
    }

    #[test]
    fn test_summary_carries_labels() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_SERVER_ID.to_string(), "abc123".to_string());
        labels.insert(LABEL_SERVER_TYPE.to_string(), "vanilla".to_string());

        let info = container_summary_to_info(ContainerSummary {
            id: Some("deadbeef".to_string()),
            names: Some(vec!["/mc-server-abc123".to_string()]),
            state: Some("exited".to_string()),
            labels: Some(labels),
            ..Default::default()
        });

        assert_eq!(info.name, "mc-server-abc123");
        assert_eq!(info.instance_id.as_deref(), Some("abc123"));
        assert_eq!(info.server_type.as_deref(), Some("vanilla"));
        assert_eq!(info.state, ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_container_is_not_an_error() {
        // This test requires Docker to be running
        let manager = match DockerManager::new(&AppConfig::default()) {
            Ok(manager) => manager,
            Err(_) => return,
        };
        if !manager.check_docker().await {
            return;
        }

        let handle = "mc-orchestra-missing-container";
        assert_eq!(manager.get_container_ip(handle).await, None);
        assert!(!manager.start_server(handle).await);
        assert!(!manager.stop_server(handle, Duration::from_secs(1)).await);
        assert!(!manager.delete_server(handle, false).await);
        assert_eq!(manager.get_stats(handle).await, None);
    }
}
