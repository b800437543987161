mod cli;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cli::{BackupCommands, Cli, Commands};
use mc_orchestra::core::{
    next_update, FileRegistry, InstanceRegistry, InstanceStatus, ManagedInstance, Orchestrator,
    ServerProperties,
};
use mc_orchestra::utils::{format_bytes, generate_hex_string, mask_sensitive, AppConfig, ContainerState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.log_level);

    let registry = Arc::new(FileRegistry::load(config.registry_path())?);

    // Registering an instance needs no daemon
    let command = match cli.command {
        Commands::Add {
            name,
            server_type,
            version,
            port,
            memory,
            cpus,
            java_args,
            motd,
            max_players,
        } => {
            let mut properties = ServerProperties::default();
            if let Some(motd) = motd {
                properties.motd = motd;
            }
            if let Some(max_players) = max_players {
                properties.max_players = max_players;
            }

            let instance = ManagedInstance {
                id: generate_hex_string(32),
                name,
                server_type,
                version,
                status: InstanceStatus::Stopped,
                container_id: None,
                host_port: port,
                console_password: generate_hex_string(24),
                memory_mb: memory,
                cpu_cores: cpus,
                java_args,
                created_at: Utc::now(),
                properties,
            };
            return add_instance(&registry, instance);
        }
        Commands::Config { write } => {
            if !write {
                print!("{}", config.to_toml()?);
                return Ok(());
            }
            let path = match cli.config {
                Some(path) => path,
                None => AppConfig::config_path()?,
            };
            config.save(&path)?;
            println!("{} Configuration written to {}", "✓".green(), path.display());
            return Ok(());
        }
        command => command,
    };

    let orchestrator = Orchestrator::new(config, registry.clone())?;
    if !orchestrator.docker().check_docker().await {
        bail!("Docker daemon is not reachable. Is Docker running?");
    }

    let result = run(&orchestrator, &registry, command).await;
    orchestrator.shutdown().await;
    result
}

fn add_instance(registry: &FileRegistry, instance: ManagedInstance) -> Result<()> {
    if instance.memory_mb == 0 || instance.cpu_cores <= 0.0 {
        bail!("Memory and CPU limits must be positive");
    }

    let id = instance.id.clone();
    let password = mask_sensitive(&instance.console_password, 4);
    registry.insert(instance)?;
    println!("{} Registered instance {}", "✓".green(), id);
    println!("Console password: {} (stored in the registry)", password);
    println!("Deploy it with: mc-orchestra deploy {}", &id[..8]);
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve(registry: &FileRegistry, key: &str) -> Result<ManagedInstance> {
    registry
        .resolve(key)
        .with_context(|| format!("No instance matches {:?}", key))
}

fn report(ok: bool, done: &str, failed: &str) -> Result<()> {
    if ok {
        println!("{} {}", "✓".green(), done);
        Ok(())
    } else {
        bail!("{}", failed)
    }
}

fn status_label(status: InstanceStatus) -> colored::ColoredString {
    match status {
        InstanceStatus::Running => status.as_str().green(),
        InstanceStatus::Starting | InstanceStatus::Stopping => status.as_str().yellow(),
        InstanceStatus::Stopped => status.as_str().normal(),
        InstanceStatus::Error => status.as_str().red(),
    }
}

async fn run(orchestrator: &Orchestrator, registry: &FileRegistry, command: Commands) -> Result<()> {
    match command {
        Commands::Add { .. } | Commands::Config { .. } => {
            bail!("this command does not need the Docker daemon")
        }
        Commands::Deploy { instance } => {
            let instance = resolve(registry, &instance)?;
            println!("Deploying {}...", instance.name);
            orchestrator.deploy(&instance.id);
            orchestrator.tasks().wait_completion().await;

            let status = registry.get(&instance.id).map(|i| i.status);
            report(
                status == Some(InstanceStatus::Running),
                &format!("Instance {} deployed", instance.name),
                &format!("Deployment of {} failed, see the log above", instance.name),
            )?;
        }
        Commands::Start { instance } => {
            let instance = resolve(registry, &instance)?;
            let ok = orchestrator.start(&instance.id).await?;
            report(ok, &format!("Instance {} started", instance.name), "Failed to start instance")?;
        }
        Commands::Stop { instance } => {
            let instance = resolve(registry, &instance)?;
            println!("Stopping {}...", instance.name);
            let ok = orchestrator.stop(&instance.id).await?;
            report(ok, &format!("Instance {} stopped", instance.name), "Failed to stop instance")?;
        }
        Commands::Restart { instance } => {
            let instance = resolve(registry, &instance)?;
            let ok = orchestrator.restart(&instance.id).await?;
            report(ok, &format!("Instance {} restarted", instance.name), "Failed to restart instance")?;
        }
        Commands::Delete {
            instance,
            volumes,
            keep_record,
        } => {
            let instance = resolve(registry, &instance)?;
            if !orchestrator.delete(&instance.id, volumes).await? {
                bail!("Failed to remove the container of {}", instance.name);
            }
            if !keep_record {
                registry.remove(&instance.id)?;
            }
            println!("{} Instance {} deleted", "✓".green(), instance.name);
        }
        Commands::Status { instance } => {
            let instances = match instance {
                Some(key) => vec![resolve(registry, &key)?],
                None => registry.list(),
            };
            handle_status(orchestrator, instances).await;
        }
        Commands::Logs { instance, tail } => {
            let instance = resolve(registry, &instance)?;
            let handle = instance
                .container_id
                .as_deref()
                .with_context(|| format!("Instance {} has no container", instance.name))?;
            let logs = orchestrator
                .docker()
                .get_logs(handle, tail)
                .await
                .context("Failed to read logs")?;
            print!("{}", logs);
        }
        Commands::List => {
            let containers = orchestrator.docker().list_managed().await;
            println!("{:<22} {:<14} {:<12} {:<30}", "Container", "Instance", "State", "Ports");
            println!("{}", "-".repeat(80));
            for container in containers {
                let instance = container.instance_id.as_deref().unwrap_or("-");
                let short = &instance[..instance.len().min(12)];
                println!(
                    "{:<22} {:<14} {:<12} {:<30}",
                    container.name,
                    short,
                    container.state.as_str(),
                    container.ports.join(", ")
                );
            }
        }
        Commands::Console { instance, command } => {
            let instance = resolve(registry, &instance)?;
            let response = orchestrator
                .execute(&instance.id, &command.join(" "))
                .await?
                .context("Console unreachable or authentication failed")?;
            println!("{}", response);
        }
        Commands::Players { instance } => {
            let instance = resolve(registry, &instance)?;
            let players = orchestrator
                .console(&instance.id)
                .await?
                .online_players()
                .await
                .context("Console unreachable or authentication failed")?;

            let online = players.online.unwrap_or(players.names.len());
            match players.max {
                Some(max) => println!("{} of {} players online", online, max),
                None => println!("{} players online", online),
            }
            for name in players.names {
                println!("  {}", name);
            }
        }
        Commands::Kick { instance, player, reason } => {
            let instance = resolve(registry, &instance)?;
            let console = orchestrator.console(&instance.id).await?;
            let ok = console.kick(&player, reason.as_deref()).await;
            report(ok, &format!("Kicked {}", player), &format!("Could not kick {}", player))?;
        }
        Commands::Ban { instance, player, reason } => {
            let instance = resolve(registry, &instance)?;
            let console = orchestrator.console(&instance.id).await?;
            let ok = console.ban(&player, reason.as_deref()).await;
            report(ok, &format!("Banned {}", player), &format!("Could not ban {}", player))?;
        }
        Commands::Pardon { instance, player } => {
            let instance = resolve(registry, &instance)?;
            let console = orchestrator.console(&instance.id).await?;
            let ok = console.pardon(&player).await;
            report(ok, &format!("Pardoned {}", player), &format!("Could not pardon {}", player))?;
        }
        Commands::Save { instance } => {
            let instance = resolve(registry, &instance)?;
            let console = orchestrator.console(&instance.id).await?;
            let ok = console.save_world().await;
            report(ok, "World saved", "Could not reach the console")?;
        }
        Commands::Say { instance, message } => {
            let instance = resolve(registry, &instance)?;
            let console = orchestrator.console(&instance.id).await?;
            let ok = console.broadcast(&message.join(" ")).await;
            report(ok, "Message sent", "Could not reach the console")?;
        }
        Commands::Mod { instance, url, name } => {
            let instance = resolve(registry, &instance)?;
            println!("Downloading {}...", name);
            orchestrator.download_mod(&instance.id, &url, &name);
            orchestrator.tasks().wait_completion().await;

            let path = orchestrator
                .config()
                .servers_dir()
                .join(&instance.id)
                .join("data/mods")
                .join(format!("{}.jar", name));
            report(
                path.exists(),
                &format!("Mod saved to {}", path.display()),
                &format!("Download of {} failed, see the log above", name),
            )?;
        }
        Commands::Backup { command } => handle_backup(orchestrator, registry, command).await?,
        Commands::Monitor { instance, json } => {
            let filter = match instance {
                Some(key) => Some(resolve(registry, &key)?.id),
                None => None,
            };
            handle_monitor(orchestrator, registry, filter, json).await?;
        }
    }

    Ok(())
}

async fn handle_status(orchestrator: &Orchestrator, instances: Vec<ManagedInstance>) {
    println!("Minecraft Server Status\n");
    println!(
        "{:<10} {:<18} {:<10} {:<10} {:<10} {:<7} {:<10}",
        "ID", "Name", "Type", "Version", "Status", "Port", "Container"
    );
    println!("{}", "-".repeat(80));

    for instance in instances {
        let container = match instance.container_id.as_deref() {
            Some(handle) => {
                let state = orchestrator
                    .docker()
                    .container_status(handle)
                    .await
                    .unwrap_or(ContainerState::Unknown);
                if state.is_running() {
                    state.as_str().green()
                } else {
                    state.as_str().normal()
                }
            }
            None => "-".normal(),
        };

        println!(
            "{:<10} {:<18} {:<10} {:<10} {:<10} {:<7} {:<10}",
            &instance.id[..instance.id.len().min(8)],
            instance.name,
            instance.server_type,
            instance.version,
            status_label(instance.status),
            instance.host_port,
            container
        );
    }
}

async fn handle_backup(
    orchestrator: &Orchestrator,
    registry: &FileRegistry,
    command: BackupCommands,
) -> Result<()> {
    match command {
        BackupCommands::Create { instance, label } => {
            let instance = resolve(registry, &instance)?;
            println!("Backing up {}...", instance.name);
            let path = orchestrator
                .create_backup(&instance.id, label.as_deref())
                .await?
                .context("Backup failed, see the log above")?;
            println!("{} Backup written to {}", "✓".green(), path.display());
        }
        BackupCommands::List { instance } => {
            let instance = resolve(registry, &instance)?;
            let backups = orchestrator.backups().list_backups(&instance.id).await;
            if backups.is_empty() {
                println!("No backups for {}", instance.name);
                return Ok(());
            }

            println!("{:<40} {:<12} {:<20}", "Name", "Size", "Created");
            println!("{}", "-".repeat(72));
            for backup in backups {
                println!(
                    "{:<40} {:<12} {:<20}",
                    backup.name,
                    format_bytes(backup.size),
                    backup.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        BackupCommands::Restore { instance, file } => {
            let instance = resolve(registry, &instance)?;
            println!("Restoring {} from {}...", instance.name, file.display());
            let ok = orchestrator.restore_backup(&instance.id, &file).await?;
            report(ok, "Backup restored", "Restore failed, the pre_restore snapshot was kept")?;
        }
        BackupCommands::Delete { file } => {
            let ok = orchestrator.backups().delete_backup(&file).await;
            report(ok, "Backup deleted", "Failed to delete backup")?;
        }
    }

    Ok(())
}

async fn handle_monitor(
    orchestrator: &Orchestrator,
    registry: &FileRegistry,
    only: Option<String>,
    json: bool,
) -> Result<()> {
    let scheduler = orchestrator.scheduler();
    let mut updates = scheduler.subscribe();
    let task = scheduler.spawn();

    if !json {
        println!(
            "Collecting metrics every {} (Ctrl+C to stop)\n",
            humantime::format_duration(orchestrator.config().metrics_interval())
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = next_update(&mut updates) => {
                let Some(update) = update else {
                    bail!("Metrics scheduler stopped unexpectedly");
                };
                if only.as_deref().is_some_and(|id| id != update.instance_id) {
                    continue;
                }
                if json {
                    println!("{}", serde_json::to_string(&update)?);
                    continue;
                }

                let name = registry
                    .get(&update.instance_id)
                    .map(|i| i.name)
                    .unwrap_or_else(|| update.instance_id.clone());
                let sample = update.sample;
                println!(
                    "{} {:<18} cpu {:>6.2}%  mem {:>10} / {:<10} ({:>5.1}%)  net rx {:>10} tx {:>10}  players {}",
                    sample.timestamp.format("%H:%M:%S"),
                    name,
                    sample.cpu_percent,
                    format_bytes(sample.memory_usage),
                    format_bytes(sample.memory_limit),
                    sample.memory_percent,
                    format_bytes(sample.network_rx),
                    format_bytes(sample.network_tx),
                    sample.online_players
                );
            }
        }
    }

    task.abort();
    Ok(())
}
