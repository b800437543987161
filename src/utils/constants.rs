/// Fixed names, ports and commands shared across the orchestration core
///
/// Values mirror what the `itzg/minecraft-server` image expects.

/// Image used for every managed server container
pub const DEFAULT_IMAGE: &str = "itzg/minecraft-server:latest";

/// Name of the isolated bridge network all managed containers join
pub const DEFAULT_NETWORK: &str = "minecraft-network";

/// Game port inside the container
pub const GAME_PORT: u16 = 25565;

/// Remote console port inside the container (never published on the host)
pub const CONSOLE_PORT: u16 = 25575;

/// Container name prefix, followed by the first 8 characters of the instance id
pub const CONTAINER_PREFIX: &str = "mc-server-";

/// Label carrying the instance id, used to discover managed containers
pub const LABEL_SERVER_ID: &str = "mc-manager.server-id";

/// Label carrying the server flavour (vanilla, paper, forge, ...)
pub const LABEL_SERVER_TYPE: &str = "mc-manager.server-type";

/// Mount point of the per-instance data directory inside the container
pub const CONTAINER_DATA_PATH: &str = "/data";

/// Worker count of the background task queue
pub const DEFAULT_WORKERS: usize = 4;

/// One hour of samples at a 5 second cadence
pub const DEFAULT_METRICS_CAPACITY: usize = 720;

pub const DEFAULT_METRICS_RETENTION_SECS: u64 = 3600;

pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;

/// Console commands used around backups
pub const CMD_SAVE_OFF: &str = "save-off";
pub const CMD_SAVE_FLUSH: &str = "save-all flush";
pub const CMD_SAVE_ON: &str = "save-on";
pub const CMD_LIST: &str = "list";

/// Archive extension for backups
pub const BACKUP_EXTENSION: &str = ".tar.gz";

/// Prefix of the snapshot taken right before a restore
pub const SAFETY_BACKUP_PREFIX: &str = "pre_restore";

/// Minimum size of a downloaded mod archive
pub const MIN_JAR_SIZE: u64 = 1024;
