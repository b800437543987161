/// Background jobs: container deployment and mod downloads
///
/// Both run on the task queue. Their errors are returned to the worker, which logs
/// them; deployment also records the outcome on the instance record.

use anyhow::{bail, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::core::docker::DockerManager;
use crate::core::registry::{InstanceRegistry, InstanceStatus};
use crate::utils::{is_safe_file_name, MIN_JAR_SIZE};

/// Create and start the container of a registered instance.
/// Status goes Starting, then Running with the handle recorded, or Error.
pub async fn deploy_instance(
    docker: &DockerManager,
    registry: &dyn InstanceRegistry,
    instance_id: &str,
) -> Result<String> {
    let Some(instance) = registry.get(instance_id) else {
        bail!("Instance {} not found", instance_id);
    };
    if let Some(handle) = &instance.container_id {
        bail!("Instance {} is already deployed as {}", instance_id, handle);
    }

    registry.set_status(instance_id, InstanceStatus::Starting)?;

    match docker.create_server(&instance.spec()).await {
        Ok(handle) => {
            registry.set_container(instance_id, Some(handle.clone()))?;
            registry.set_status(instance_id, InstanceStatus::Running)?;
            info!(instance = instance_id, container = %handle, "instance deployed");
            Ok(handle)
        }
        Err(e) => {
            error!(instance = instance_id, "Deployment failed: {:#}", e);
            registry.set_status(instance_id, InstanceStatus::Error)?;
            Err(e)
        }
    }
}

pub fn mods_dir(servers_dir: &Path, instance_id: &str) -> PathBuf {
    servers_dir.join(instance_id).join("data").join("mods")
}

/// Download `url` to `<servers>/<id>/data/mods/<name>.jar`. The file is removed
/// again unless it downloads completely and validates as an archive.
pub async fn download_mod(
    client: &reqwest::Client,
    servers_dir: &Path,
    instance_id: &str,
    url: &str,
    name: &str,
) -> Result<PathBuf> {
    if !is_safe_file_name(name) {
        bail!("Invalid mod name: {:?}", name);
    }

    let dir = mods_dir(servers_dir, instance_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.jar", name));

    let result = fetch_to_file(client, url, &path).await.and_then(|_| {
        if validate_jar(&path) {
            Ok(())
        } else {
            bail!("Downloaded file is not a valid JAR: {}", path.display())
        }
    });

    match result {
        Ok(()) => {
            info!(instance = instance_id, mod_name = name, "mod downloaded");
            Ok(path)
        }
        Err(e) => {
            if path.exists() {
                let _ = tokio::fs::remove_file(&path).await;
            }
            Err(e)
        }
    }
}

async fn fetch_to_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    if !response.status().is_success() {
        bail!("Failed to download {}: HTTP {}", url, response.status());
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    while let Some(chunk) = response.chunk().await.context("Failed to read download")? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// At least 1 KiB and every entry readable with a matching checksum
pub fn validate_jar(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if metadata.len() < MIN_JAR_SIZE {
        return false;
    }

    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(mut archive) = zip::ZipArchive::new(file) else {
        return false;
    };

    (0..archive.len()).all(|i| match archive.by_index(i) {
        Ok(mut entry) => io::copy(&mut entry, &mut io::sink()).is_ok(),
        Err(_) => false,
    })
}

/// HTTP client for mod downloads
pub fn download_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("mc-orchestra/{}", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to build HTTP client")
}
