/// Managed instance records
///
/// `InstanceRegistry` is the boundary to whatever store keeps instance records. The
/// CLI uses `FileRegistry`, which keeps every record in one `instances.toml`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::console::ConsoleTarget;
use crate::core::container_config::{ServerProperties, ServerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub id: String,
    pub name: String,
    pub server_type: String,
    pub version: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub host_port: u16,
    pub console_password: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_args: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: ServerProperties,
}

impl ManagedInstance {
    pub fn spec(&self) -> ServerSpec {
        ServerSpec {
            instance_id: self.id.clone(),
            server_type: self.server_type.clone(),
            version: self.version.clone(),
            memory_mb: self.memory_mb,
            cpu_cores: self.cpu_cores,
            host_port: self.host_port,
            console_password: self.console_password.clone(),
            properties: self.properties.clone(),
            java_args: self.java_args.clone(),
        }
    }

    /// Console endpoint of this instance at `host`
    pub fn console_target(&self, host: impl Into<String>, port: u16) -> ConsoleTarget {
        ConsoleTarget::new(host, port, self.console_password.clone())
    }
}

pub trait InstanceRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<ManagedInstance>;

    fn list(&self) -> Vec<ManagedInstance>;

    fn set_status(&self, id: &str, status: InstanceStatus) -> Result<()>;

    fn set_container(&self, id: &str, container_id: Option<String>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    instances: Vec<ManagedInstance>,
}

/// Registry persisted to a TOML file after every change
pub struct FileRegistry {
    path: PathBuf,
    instances: RwLock<Vec<ManagedInstance>>,
}

impl FileRegistry {
    /// Load `path`, starting empty if it does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read registry {}", path.display()))?;
            toml::from_str::<RegistryFile>(&contents)
                .with_context(|| format!("Failed to parse registry {}", path.display()))?
        } else {
            RegistryFile::default()
        };

        debug!(path = %path.display(), count = file.instances.len(), "registry loaded");
        Ok(Self {
            path,
            instances: RwLock::new(file.instances),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, instances: &[ManagedInstance]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = RegistryFile {
            instances: instances.to_vec(),
        };
        let contents = toml::to_string_pretty(&file).context("Failed to serialize registry")?;

        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }

    fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ManagedInstance),
    {
        let mut instances = self.instances.write();
        let Some(instance) = instances.iter_mut().find(|i| i.id == id) else {
            bail!("Instance {} not found", id);
        };
        f(instance);
        self.persist(&instances)
    }

    pub fn insert(&self, instance: ManagedInstance) -> Result<()> {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.id == instance.id) {
            bail!("Instance {} already exists", instance.id);
        }
        if instances.iter().any(|i| i.name == instance.name) {
            bail!("An instance named {} already exists", instance.name);
        }
        if let Some(other) = instances.iter().find(|i| i.host_port == instance.host_port) {
            bail!("Port {} is already used by {}", instance.host_port, other.name);
        }

        instances.push(instance);
        self.persist(&instances)
    }

    pub fn remove(&self, id: &str) -> Result<Option<ManagedInstance>> {
        let mut instances = self.instances.write();
        let Some(index) = instances.iter().position(|i| i.id == id) else {
            return Ok(None);
        };
        let removed = instances.remove(index);
        self.persist(&instances)?;
        Ok(Some(removed))
    }

    /// Look up by exact id, exact name or unique id prefix
    pub fn resolve(&self, key: &str) -> Option<ManagedInstance> {
        let instances = self.instances.read();
        if let Some(found) = instances.iter().find(|i| i.id == key || i.name == key) {
            return Some(found.clone());
        }

        let mut matches = instances.iter().filter(|i| i.id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(found), None) if !key.is_empty() => Some(found.clone()),
            _ => None,
        }
    }
}

impl InstanceRegistry for FileRegistry {
    fn get(&self, id: &str) -> Option<ManagedInstance> {
        self.instances.read().iter().find(|i| i.id == id).cloned()
    }

    fn list(&self) -> Vec<ManagedInstance> {
        self.instances.read().clone()
    }

    fn set_status(&self, id: &str, status: InstanceStatus) -> Result<()> {
        self.update(id, |instance| instance.status = status)
    }

    fn set_container(&self, id: &str, container_id: Option<String>) -> Result<()> {
        self.update(id, |instance| instance.container_id = container_id)
    }
}

#[cfg(test)]
pub(crate) fn sample_instance(id: &str, name: &str, port: u16) -> ManagedInstance {
    ManagedInstance {
        id: id.to_string(),
        name: name.to_string(),
        server_type: "paper".to_string(),
        version: "1.20.4".to_string(),
        status: InstanceStatus::Stopped,
        container_id: None,
        host_port: port,
        console_password: "secret".to_string(),
        memory_mb: 2048,
        cpu_cores: 2.0,
        java_args: None,
        created_at: Utc::now(),
        properties: ServerProperties::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persisted_across_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.toml");

        let registry = FileRegistry::load(&path).unwrap();
        assert!(registry.list().is_empty());

        let mut instance = sample_instance("0a1b2c3d4e5f", "survival", 25570);
        instance.properties.motd = "Welcome".to_string();
        instance.java_args = Some("-XX:+UseG1GC".to_string());
        registry.insert(instance).unwrap();
        registry.set_status("0a1b2c3d4e5f", InstanceStatus::Running).unwrap();
        registry
            .set_container("0a1b2c3d4e5f", Some("deadbeef".to_string()))
            .unwrap();

        let reloaded = FileRegistry::load(&path).unwrap();
        let instance = reloaded.get("0a1b2c3d4e5f").unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.container_id.as_deref(), Some("deadbeef"));
        assert_eq!(instance.properties.motd, "Welcome");
        assert_eq!(instance.java_args.as_deref(), Some("-XX:+UseG1GC"));
    }

    #[test]
    fn test_insert_rejects_conflicts() {
        let dir = TempDir::new().unwrap();
        let registry = FileRegistry::load(dir.path().join("instances.toml")).unwrap();

        registry.insert(sample_instance("aaa", "one", 25570)).unwrap();
        assert!(registry.insert(sample_instance("aaa", "two", 25571)).is_err());
        assert!(registry.insert(sample_instance("bbb", "one", 25572)).is_err());
        assert!(registry.insert(sample_instance("ccc", "three", 25570)).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_resolve_and_remove() {
        let dir = TempDir::new().unwrap();
        let registry = FileRegistry::load(dir.path().join("instances.toml")).unwrap();
        registry.insert(sample_instance("abc123", "lobby", 25570)).unwrap();
        registry.insert(sample_instance("abd456", "creative", 25571)).unwrap();

        assert_eq!(registry.resolve("lobby").unwrap().id, "abc123");
        assert_eq!(registry.resolve("abd").unwrap().name, "creative");
        assert!(registry.resolve("ab").is_none());
        assert!(registry.resolve("").is_none());

        assert!(registry.remove("abc123").unwrap().is_some());
        assert!(registry.remove("abc123").unwrap().is_none());
        assert!(registry.set_status("abc123", InstanceStatus::Running).is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.toml");
        let registry = FileRegistry::load(&path).unwrap();
        registry.insert(sample_instance("abc", "x", 25570)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[[instances]]"));
        assert!(contents.contains("status = \"stopped\""));
    }
}
