/// CLI argument parsing
///
/// Every flag can also be set from a `BIVAC_*` environment variable.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::client::DEFAULT_REMOTE_ADDRESS;
use crate::core::engine::DEFAULT_RETENTION;
use crate::orchestrators::docker::DEFAULT_ENDPOINT;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

pub fn get_version() -> &'static str {
    VERSION_WITH_BUILD
}

#[derive(Parser)]
#[command(name = "bivac")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "BIVAC_VERBOSE")]
    pub verbose: bool,

    /// Only backup whitelisted volumes (comma separated)
    #[arg(short, long, global = true, env = "BIVAC_VOLUMES_WHITELIST", value_delimiter = ',')]
    pub whitelist: Vec<String>,

    /// Do not backup blacklisted volumes (comma separated)
    #[arg(short, long, global = true, env = "BIVAC_VOLUMES_BLACKLIST", value_delimiter = ',')]
    pub blacklist: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start Bivac backup manager
    #[cfg(feature = "server")]
    Manager(ManagerArgs),

    /// Run Bivac agent
    Agent(AgentArgs),

    /// Backup volumes
    Backup {
        /// Volume names or ids
        #[arg(required = true)]
        volumes: Vec<String>,

        /// Force backup by removing locks
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Restore volumes
    Restore {
        /// Volume names or ids
        #[arg(required = true)]
        volumes: Vec<String>,

        /// Force restore by removing locks
        #[arg(long)]
        force: bool,

        /// Snapshot to restore
        #[arg(short, long, default_value = "latest")]
        snapshot: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Show volumes
    Volumes {
        /// Show details of these volume ids only
        ids: Vec<String>,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Retrieve Bivac informations
    Info {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Run Restic command on a volume's repository
    Restic {
        /// Volume ID
        #[arg(long, required = true)]
        volume: String,

        /// Restic arguments, after `--`
        #[arg(last = true)]
        args: Vec<String>,

        #[command(flatten)]
        remote: RemoteArgs,
    },
}

/// Connection to a running manager
#[derive(Args, Clone)]
pub struct RemoteArgs {
    /// Address of the remote Bivac server
    #[arg(long = "remote.address", env = "BIVAC_REMOTE_ADDRESS", default_value = DEFAULT_REMOTE_ADDRESS)]
    pub remote_address: String,

    /// Pre-shared key
    #[arg(long = "server.psk", env = "BIVAC_SERVER_PSK", default_value = "", hide_env_values = true)]
    pub psk: String,
}

#[derive(Args, Clone)]
pub struct ManagerArgs {
    /// Address to bind on
    #[arg(long = "server.address", env = "BIVAC_SERVER_ADDRESS", default_value = "0.0.0.0:8182")]
    pub server_address: String,

    /// Pre-shared key, generated when empty
    #[arg(long = "server.psk", env = "BIVAC_SERVER_PSK", default_value = "", hide_env_values = true)]
    pub psk: String,

    /// Orchestrator on which Bivac should connect to, detected when empty
    #[arg(short, long, env = "BIVAC_ORCHESTRATOR")]
    pub orchestrator: Option<String>,

    /// Docker endpoint
    #[arg(long = "docker.endpoint", env = "BIVAC_DOCKER_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub docker_endpoint: String,

    /// Namespace where Bivac is deployed and volumes are discovered
    #[arg(long = "kubernetes.namespace", env = "BIVAC_KUBERNETES_NAMESPACE", default_value = "")]
    pub kubernetes_namespace: String,

    /// Backup volumes of all namespaces
    #[arg(long = "kubernetes.all-namespaces", env = "BIVAC_KUBERNETES_ALL_NAMESPACES")]
    pub kubernetes_all_namespaces: bool,

    /// Path to a kubeconfig file, in-cluster configuration when unset
    #[arg(long = "kubernetes.kubeconfig", env = "BIVAC_KUBERNETES_KUBECONFIG")]
    pub kubernetes_kubeconfig: Option<PathBuf>,

    /// Service account of the agent pods
    #[arg(long = "kubernetes.agent-service-account", env = "BIVAC_KUBERNETES_AGENT_SERVICE_ACCOUNT", default_value = "")]
    pub kubernetes_agent_service_account: String,

    /// Only backup PVCs annotated `bivac.backup=true`
    #[arg(long = "kubernetes.whitelist-annotation", env = "BIVAC_KUBERNETES_WHITELIST_ANNOTATION")]
    pub kubernetes_whitelist_annotation: bool,

    /// Rancher API URL
    #[arg(long = "cattle.url", env = "BIVAC_CATTLE_URL", default_value = "")]
    pub cattle_url: String,

    /// Rancher API access key
    #[arg(long = "cattle.accesskey", env = "BIVAC_CATTLE_ACCESS_KEY", default_value = "")]
    pub cattle_access_key: String,

    /// Rancher API secret key
    #[arg(long = "cattle.secretkey", env = "BIVAC_CATTLE_SECRET_KEY", default_value = "", hide_env_values = true)]
    pub cattle_secret_key: String,

    /// Restic repository prefix, volumes go to <target>/<path>/<name>
    #[arg(short = 'r', long = "target.url", env = "BIVAC_TARGET_URL")]
    pub target_url: String,

    /// Base URL agents post their logs to
    #[arg(long = "log.server", env = "BIVAC_LOG_SERVER")]
    pub log_server: Option<String>,

    /// Agent image
    #[arg(long = "agent.image", env = "BIVAC_AGENT_IMAGE", default_value = "camptocamp/bivac:2.5")]
    pub agent_image: String,

    /// Volumes refresh rate
    #[arg(long = "refresh.rate", env = "BIVAC_REFRESH_RATE", default_value = "10m", value_parser = humantime::parse_duration)]
    pub refresh_rate: Duration,

    /// Minimum time between two backups of a volume
    #[arg(long = "backup.interval", env = "BIVAC_BACKUP_INTERVAL", default_value = "23h", value_parser = humantime::parse_duration)]
    pub backup_interval: Duration,

    /// Preferred backup time (accepted, not used for scheduling)
    #[arg(long = "default.preferred-time", env = "BIVAC_DEFAULT_PREFERRED_TIME")]
    pub default_preferred_time: Option<String>,

    /// Providers configuration file
    #[arg(long = "providers.config", env = "BIVAC_PROVIDERS_CONFIG", default_value = "/providers-config.default.toml")]
    pub providers_config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    Backup,
    Restore,
    Restic,
}

#[derive(Args, Clone)]
pub struct AgentArgs {
    /// Operation to run
    #[arg(value_enum)]
    pub kind: AgentKind,

    /// The target URL to push the backups to
    #[arg(short = 'r', long = "target.url", default_value = "")]
    pub target_url: String,

    /// Path to the volume to backup
    #[arg(short = 'p', long = "backup.path", default_value = "")]
    pub backup_path: String,

    /// Custom hostname
    #[arg(long, default_value = "")]
    pub host: String,

    /// Force a backup by removing all locks
    #[arg(long)]
    pub force: bool,

    /// Address where the manager will collect the logs
    #[arg(long = "log.receiver")]
    pub log_receiver: Option<String>,

    /// Name of snapshot to restore
    #[arg(short, long, default_value = "latest")]
    pub snapshot: String,

    /// Check the repository after the backup
    #[arg(long, env = "BIVAC_VERIFY")]
    pub verify: bool,

    /// Arguments of `restic forget`
    #[arg(long, env = "RESTIC_FORGET_ARGS", default_value = DEFAULT_RETENTION)]
    pub retention: String,

    /// Pre-shared key of the log receiver
    #[arg(long = "server.psk", env = "BIVAC_SERVER_PSK", default_value = "", hide_env_values = true)]
    pub psk: String,

    /// Raw restic arguments, after `--`
    #[arg(last = true)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_backup_args() {
        let cli = Cli::try_parse_from([
            "bivac",
            "agent",
            "backup",
            "-p",
            "/data/backups",
            "-r",
            "s3:bucket/host/data",
            "--host",
            "host",
            "--force",
            "--log.receiver",
            "http://bivac:8182/backup/id/logs",
        ])
        .unwrap();

        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.kind, AgentKind::Backup);
        assert_eq!(args.backup_path, "/data/backups");
        assert_eq!(args.target_url, "s3:bucket/host/data");
        assert!(args.force);
        assert_eq!(args.log_receiver.as_deref(), Some("http://bivac:8182/backup/id/logs"));
        assert_eq!(args.snapshot, "latest");
    }

    #[test]
    fn test_agent_restic_passthrough() {
        let cli = Cli::try_parse_from([
            "bivac", "agent", "restic", "-r", "repo", "--host", "h", "--", "stats", "--mode", "raw",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.kind, AgentKind::Restic);
        assert_eq!(args.args, ["stats", "--mode", "raw"]);
    }

    #[test]
    fn test_global_filters() {
        let cli = Cli::try_parse_from(["bivac", "volumes", "-w", "a,b", "-b", "c"]).unwrap();
        assert_eq!(cli.whitelist, ["a", "b"]);
        assert_eq!(cli.blacklist, ["c"]);
    }

    #[test]
    fn test_backup_requires_volume() {
        assert!(Cli::try_parse_from(["bivac", "backup"]).is_err());
        let cli = Cli::try_parse_from(["bivac", "backup", "data", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Backup { force: true, .. }));
    }

    #[cfg(feature = "server")]
    #[test]
    fn test_manager_durations() {
        let cli = Cli::try_parse_from([
            "bivac",
            "manager",
            "--target.url",
            "s3:bucket",
            "--refresh.rate",
            "30s",
        ])
        .unwrap();
        let Commands::Manager(args) = cli.command else {
            panic!("expected manager command");
        };
        assert_eq!(args.refresh_rate, Duration::from_secs(30));
        assert_eq!(args.backup_interval, Duration::from_secs(23 * 3600));
    }
}
