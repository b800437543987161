/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "mc-orchestra")]
#[command(author, version = VERSION_WITH_BUILD, about = "Run Minecraft servers in Docker containers", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/mc-orchestra/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new server instance
    Add {
        /// Display name, unique across instances
        name: String,

        /// Server flavour (vanilla, paper, forge, fabric, ...)
        #[arg(short = 't', long = "type", default_value = "vanilla")]
        server_type: String,

        /// Minecraft version
        #[arg(short, long, default_value = "LATEST")]
        version: String,

        /// Host port the game port is published on
        #[arg(short, long)]
        port: u16,

        /// Memory limit in MB
        #[arg(short, long, default_value = "2048")]
        memory: u64,

        /// CPU limit in cores
        #[arg(long, default_value = "2.0")]
        cpus: f64,

        /// Extra JVM options
        #[arg(long)]
        java_args: Option<String>,

        /// Message of the day
        #[arg(long)]
        motd: Option<String>,

        /// Maximum player count
        #[arg(long)]
        max_players: Option<u32>,
    },

    /// Create and start the container of an instance
    Deploy {
        instance: String,
    },

    /// Start an instance
    Start {
        instance: String,
    },

    /// Stop an instance
    Stop {
        instance: String,
    },

    /// Restart an instance
    Restart {
        instance: String,
    },

    /// Remove an instance and its container
    Delete {
        instance: String,

        /// Also remove the container's volumes
        #[arg(long)]
        volumes: bool,

        /// Keep the registry record, only remove the container
        #[arg(long)]
        keep_record: bool,
    },

    /// Show instance status
    Status {
        /// Single instance (default: all)
        instance: Option<String>,
    },

    /// View logs
    Logs {
        instance: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,
    },

    /// List managed containers, including ones without a record
    List,

    /// Send a console command
    Console {
        instance: String,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Show online players
    Players {
        instance: String,
    },

    /// Kick a player
    Kick {
        instance: String,
        player: String,
        reason: Option<String>,
    },

    /// Ban a player
    Ban {
        instance: String,
        player: String,
        reason: Option<String>,
    },

    /// Lift a ban
    Pardon {
        instance: String,
        player: String,
    },

    /// Flush the world to disk
    Save {
        instance: String,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },

    /// Broadcast a message to all players
    Say {
        instance: String,

        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// Download a mod into the instance's mods directory
    Mod {
        instance: String,
        url: String,

        /// File name without the .jar extension
        #[arg(short, long)]
        name: String,
    },

    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Collect and print metrics until interrupted
    Monitor {
        /// Single instance (default: all running)
        instance: Option<String>,

        /// Print one JSON object per sample
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create backup of a running instance
    Create {
        instance: String,

        /// Archive name (default: <name>_<timestamp>)
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List backups
    List { instance: String },

    /// Restore from backup (instance must be stopped)
    Restore { instance: String, file: PathBuf },

    /// Delete a backup archive
    Delete { file: PathBuf },
}
