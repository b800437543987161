/// Typed server configuration and its translation to a Docker container definition
///
/// Nothing here talks to the daemon: `build_container_config` produces the bollard
/// `Config` that `DockerManager::create_server` submits.

use bollard::container::Config;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::utils::{CONTAINER_DATA_PATH, CONTAINER_PREFIX, LABEL_SERVER_ID, LABEL_SERVER_TYPE};

/// Gameplay properties written to server.properties by the image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerProperties {
    pub online_mode: bool,
    pub difficulty: String,
    pub max_players: u32,
    pub allow_nether: bool,
    pub announce_player_achievements: bool,
    pub enable_command_block: bool,
    pub spawn_protection: u32,
    pub view_distance: u32,
    pub pvp: bool,
    pub gamemode: String,
    pub motd: String,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            online_mode: true,
            difficulty: "normal".to_string(),
            max_players: 20,
            allow_nether: true,
            announce_player_achievements: true,
            enable_command_block: false,
            spawn_protection: 16,
            view_distance: 10,
            pvp: true,
            gamemode: "survival".to_string(),
            motd: "A Minecraft Server".to_string(),
        }
    }
}

/// Everything needed to create one server container
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub instance_id: String,
    /// vanilla, paper, forge, ...
    pub server_type: String,
    pub version: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub host_port: u16,
    pub console_password: String,
    pub properties: ServerProperties,
    pub java_args: Option<String>,
}

/// Environment consumed by the server image. Booleans are rendered as
/// lowercase `true`/`false`, numbers in decimal.
#[derive(Debug, Clone)]
pub struct ServerEnvironment {
    pub version: String,
    pub server_type: String,
    pub memory_mb: u64,
    pub console_password: String,
    pub console_port: u16,
    pub properties: ServerProperties,
    pub java_args: Option<String>,
}

impl ServerEnvironment {
    pub fn from_spec(spec: &ServerSpec, console_port: u16) -> Self {
        Self {
            version: spec.version.clone(),
            server_type: spec.server_type.clone(),
            memory_mb: spec.memory_mb,
            console_password: spec.console_password.clone(),
            console_port,
            properties: spec.properties.clone(),
            java_args: spec.java_args.clone(),
        }
    }

    pub fn to_env(&self) -> Vec<String> {
        let p = &self.properties;
        let mut vars: Vec<(&str, String)> = vec![
            ("EULA", "TRUE".to_string()),
            ("VERSION", self.version.clone()),
            ("TYPE", self.server_type.to_uppercase()),
            ("MEMORY", format!("{}M", self.memory_mb)),
            ("ENABLE_RCON", flag(true)),
            ("RCON_PASSWORD", self.console_password.clone()),
            ("RCON_PORT", self.console_port.to_string()),
            ("ONLINE_MODE", flag(p.online_mode)),
            ("DIFFICULTY", p.difficulty.clone()),
            ("MAX_PLAYERS", p.max_players.to_string()),
            ("ALLOW_NETHER", flag(p.allow_nether)),
            ("ANNOUNCE_PLAYER_ACHIEVEMENTS", flag(p.announce_player_achievements)),
            ("ENABLE_COMMAND_BLOCK", flag(p.enable_command_block)),
            ("SPAWN_PROTECTION", p.spawn_protection.to_string()),
            ("VIEW_DISTANCE", p.view_distance.to_string()),
            ("PVP", flag(p.pvp)),
            ("GAMEMODE", p.gamemode.clone()),
            ("MOTD", p.motd.clone()),
        ];

        if let Some(args) = self.java_args.as_ref().filter(|a| !a.trim().is_empty()) {
            vars.push(("JVM_OPTS", args.clone()));
        }

        vars.into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

fn flag(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

/// Deterministic container name: prefix plus the first 8 characters of the id
pub fn container_name(instance_id: &str) -> String {
    let short: String = instance_id.chars().take(8).collect();
    format!("{}{}", CONTAINER_PREFIX, short)
}

/// Cores to the daemon's nano-CPU unit
pub fn nano_cpus(cores: f64) -> i64 {
    (cores * 1e9) as i64
}

pub fn memory_bytes(memory_mb: u64) -> i64 {
    (memory_mb * 1024 * 1024) as i64
}

/// Ports, limits, mounts and labels for one server container
pub struct ContainerLayout<'a> {
    pub image: &'a str,
    pub network: &'a str,
    pub data_dir: &'a Path,
    pub game_port: u16,
    pub console_port: u16,
}

pub fn build_container_config(spec: &ServerSpec, layout: &ContainerLayout<'_>) -> Config<String> {
    let env = ServerEnvironment::from_spec(spec, layout.console_port).to_env();

    let game_key = format!("{}/tcp", layout.game_port);
    let console_key = format!("{}/tcp", layout.console_port);

    // Both ports are exposed on the managed network; only the game port is published
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(game_key.clone(), HashMap::new());
    exposed_ports.insert(console_key, HashMap::new());

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        game_key,
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let mut labels = HashMap::new();
    labels.insert(LABEL_SERVER_ID.to_string(), spec.instance_id.clone());
    labels.insert(LABEL_SERVER_TYPE.to_string(), spec.server_type.clone());

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            layout.data_dir.display(),
            CONTAINER_DATA_PATH
        )]),
        port_bindings: Some(port_bindings),
        memory: Some(memory_bytes(spec.memory_mb)),
        nano_cpus: Some(nano_cpus(spec.cpu_cores)),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        network_mode: Some(layout.network.to_string()),
        ..Default::default()
    };

    Config {
        image: Some(layout.image.to_string()),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}
