/// Service facade used by the binary
///
/// Owns one instance of each long-lived service and serializes every lifecycle and
/// backup operation per instance through `InstanceLocks`.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::backup::BackupManager;
use crate::core::console::ConsoleTarget;
use crate::core::docker::DockerManager;
use crate::core::jobs::{deploy_instance, download_client, download_mod};
use crate::core::locks::InstanceLocks;
use crate::core::metrics::MetricsCollector;
use crate::core::monitor::MetricsScheduler;
use crate::core::registry::{InstanceRegistry, InstanceStatus, ManagedInstance};
use crate::core::tasks::TaskQueue;
use crate::utils::AppConfig;

pub struct Orchestrator {
    config: AppConfig,
    docker: Arc<DockerManager>,
    registry: Arc<dyn InstanceRegistry>,
    tasks: Arc<TaskQueue>,
    metrics: Arc<MetricsCollector>,
    backups: Arc<BackupManager>,
    locks: Arc<InstanceLocks>,
    http: reqwest::Client,
}

impl Orchestrator {
    /// Build every service from `config`. Must run inside a tokio runtime.
    pub fn new(config: AppConfig, registry: Arc<dyn InstanceRegistry>) -> Result<Self> {
        let docker = DockerManager::new(&config)?;
        Self::with_docker(config, docker, registry)
    }

    pub fn with_docker(
        config: AppConfig,
        docker: DockerManager,
        registry: Arc<dyn InstanceRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            docker: Arc::new(docker),
            registry,
            tasks: Arc::new(TaskQueue::new(config.workers)),
            metrics: Arc::new(MetricsCollector::from_config(&config)),
            backups: Arc::new(BackupManager::from_config(&config)?),
            locks: Arc::new(InstanceLocks::new()),
            http: download_client()?,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn docker(&self) -> &DockerManager {
        &self.docker
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    fn instance(&self, id: &str) -> Result<ManagedInstance> {
        self.registry
            .get(id)
            .with_context(|| format!("Instance {} not found", id))
    }

    fn handle(instance: &ManagedInstance) -> Result<&str> {
        instance
            .container_id
            .as_deref()
            .with_context(|| format!("Instance {} has no container, deploy it first", instance.name))
    }

    /// Queue container creation. Progress is visible through the instance status.
    pub fn deploy(&self, id: &str) -> bool {
        let docker = self.docker.clone();
        let registry = self.registry.clone();
        let locks = self.locks.clone();
        let id = id.to_string();

        self.tasks.submit(format!("deploy {}", id), move || async move {
            let _guard = locks.acquire(&id).await;
            deploy_instance(&docker, registry.as_ref(), &id).await.map(|_| ())
        })
    }

    /// Queue a mod download into the instance's mods directory
    pub fn download_mod(&self, id: &str, url: &str, name: &str) -> bool {
        let client = self.http.clone();
        let servers_dir = self.config.servers_dir();
        let (id, url, name) = (id.to_string(), url.to_string(), name.to_string());

        self.tasks.submit(format!("download {} for {}", name, id), move || async move {
            download_mod(&client, &servers_dir, &id, &url, &name).await.map(|_| ())
        })
    }

    pub async fn start(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;
        let handle = Self::handle(&instance)?;

        let started = self.docker.start_server(handle).await;
        if started {
            self.registry.set_status(id, InstanceStatus::Running)?;
        }
        Ok(started)
    }

    pub async fn stop(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;
        let handle = Self::handle(&instance)?;

        self.registry.set_status(id, InstanceStatus::Stopping)?;
        let stopped = self.docker.stop_server(handle, self.config.stop_timeout()).await;
        let status = if stopped { InstanceStatus::Stopped } else { instance.status };
        self.registry.set_status(id, status)?;
        Ok(stopped)
    }

    pub async fn restart(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;
        let handle = Self::handle(&instance)?;

        let restarted = self.docker.restart_server(handle, self.config.stop_timeout()).await;
        if restarted {
            self.registry.set_status(id, InstanceStatus::Running)?;
        }
        Ok(restarted)
    }

    /// Remove the container and its metrics history. The record itself stays.
    pub async fn delete(&self, id: &str, remove_volumes: bool) -> Result<bool> {
        let guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;

        if let Some(handle) = instance.container_id.as_deref() {
            if !self.docker.delete_server(handle, remove_volumes).await
                && self.docker.container_status(handle).await.is_some()
            {
                return Ok(false);
            }
        }

        self.registry.set_container(id, None)?;
        self.registry.set_status(id, InstanceStatus::Stopped)?;
        self.metrics.forget(id);

        drop(guard);
        self.locks.remove(id);
        info!(instance = %instance.name, "instance container removed");
        Ok(true)
    }

    /// Console endpoint, resolved on the managed network
    pub async fn console(&self, id: &str) -> Result<ConsoleTarget> {
        let instance = self.instance(id)?;
        let handle = Self::handle(&instance)?;

        let host = match self.docker.get_container_ip(handle).await {
            Some(ip) => ip,
            None => {
                warn!(instance = %instance.name, "no address on {}, trying localhost", self.docker.network());
                "localhost".to_string()
            }
        };

        Ok(instance
            .console_target(host, self.config.console_port)
            .with_timeouts(self.config.console_timeout(), Some(self.config.command_timeout())))
    }

    pub async fn execute(&self, id: &str, command: &str) -> Result<Option<String>> {
        Ok(self.console(id).await?.execute(command).await)
    }

    /// Back up a running instance
    pub async fn create_backup(&self, id: &str, label: Option<&str>) -> Result<Option<PathBuf>> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;
        if instance.status != InstanceStatus::Running {
            bail!("Instance {} must be running to back up (status: {})", instance.name, instance.status);
        }

        let console = self.console(id).await?;
        Ok(self
            .backups
            .create_backup(id, &instance.name, &console, label)
            .await)
    }

    /// Restore a stopped instance from `archive`
    pub async fn restore_backup(&self, id: &str, archive: &Path) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;
        let instance = self.instance(id)?;
        if matches!(instance.status, InstanceStatus::Running | InstanceStatus::Starting) {
            bail!("Stop instance {} before restoring", instance.name);
        }

        Ok(self.backups.restore_backup(id, archive).await)
    }

    pub fn scheduler(&self) -> Arc<MetricsScheduler> {
        Arc::new(MetricsScheduler::new(
            self.docker.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.config.console_port,
            self.config.console_timeout(),
            self.config.command_timeout(),
            self.config.metrics_interval(),
        ))
    }

    /// Wait for queued jobs, then stop the workers
    pub async fn shutdown(&self) {
        self.tasks.wait_completion().await;
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{sample_instance, FileRegistry};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<FileRegistry>,
        orchestrator: Orchestrator,
    }

    /// Orchestrator wired to a daemon socket that does not exist
    fn fixture() -> Option<Fixture> {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            docker_socket: Some(dir.path().join("no-daemon.sock").display().to_string()),
            workers: 1,
            ..AppConfig::default()
        };
        let registry = Arc::new(FileRegistry::load(config.registry_path()).unwrap());
        let docker = DockerManager::new(&config).ok()?;
        let orchestrator = Orchestrator::with_docker(config, docker, registry.clone()).unwrap();
        Some(Fixture {
            _dir: dir,
            registry,
            orchestrator,
        })
    }

    #[tokio::test]
    async fn test_deploy_failure_recorded_by_worker() {
        let Some(f) = fixture() else { return };
        f.registry.insert(sample_instance("abc", "lobby", 25570)).unwrap();

        assert!(f.orchestrator.deploy("abc"));
        f.orchestrator.shutdown().await;

        assert_eq!(f.registry.get("abc").unwrap().status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_operations_need_a_container() {
        let Some(f) = fixture() else { return };
        f.registry.insert(sample_instance("abc", "lobby", 25570)).unwrap();

        assert!(f.orchestrator.start("abc").await.is_err());
        assert!(f.orchestrator.stop("abc").await.is_err());
        assert!(f.orchestrator.execute("abc", "list").await.is_err());
        assert!(f.orchestrator.start("missing").await.is_err());

        assert!(f.orchestrator.delete("abc", false).await.unwrap());
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_instance_operations_wait_their_turn() {
        let Some(f) = fixture() else { return };
        f.registry.insert(sample_instance("abc", "lobby", 25570)).unwrap();
        f.registry.insert(sample_instance("def", "hub", 25571)).unwrap();
        let archive = f.orchestrator.backups().backup_dir("abc").join("x.tar.gz");

        let busy = f.orchestrator.locks.acquire("abc").await;

        let restore = f.orchestrator.restore_backup("abc", &archive);
        tokio::pin!(restore);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut restore)
            .await
            .is_err());

        // Other instances are not held up
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            f.orchestrator.restore_backup("def", &archive),
        )
        .await;
        assert!(!other.unwrap().unwrap());

        // A delete that released its lock must not let a new caller jump the queue
        drop(busy);
        f.orchestrator.locks.remove("abc");
        let late = f.orchestrator.restore_backup("abc", &archive);
        tokio::pin!(late);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut late)
            .await
            .is_err());

        assert!(!restore.await.unwrap());
        assert!(!late.await.unwrap());
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_state_rules() {
        let Some(f) = fixture() else { return };
        f.registry.insert(sample_instance("abc", "lobby", 25570)).unwrap();

        let err = f.orchestrator.create_backup("abc", None).await.unwrap_err();
        assert!(err.to_string().contains("must be running"));

        f.registry.set_status("abc", InstanceStatus::Running).unwrap();
        let archive = f.orchestrator.backups().backup_dir("abc").join("x.tar.gz");
        assert!(f.orchestrator.restore_backup("abc", &archive).await.is_err());

        f.registry.set_status("abc", InstanceStatus::Stopped).unwrap();
        assert!(!f.orchestrator.restore_backup("abc", &archive).await.unwrap());
        f.orchestrator.shutdown().await;
    }
}
