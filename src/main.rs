use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bivac::cli::{AgentArgs, AgentKind, Cli, Commands, RemoteArgs};
use bivac::core::agent::{self, AgentAction, AgentOptions};
use bivac::core::client::BivacClient;
use bivac::core::engine::{retention_args, Engine};
use bivac::core::volume::{BackupStatus, Volume};
use bivac::utils::{format_backup_date, truncate_string};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr, stdout is reserved for command output
fn init_logging(verbose: bool) {
    let default = if verbose { "bivac=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        #[cfg(feature = "server")]
        Commands::Manager(args) => {
            handle_manager(args, cli.whitelist, cli.blacklist).await?;
            Ok(0)
        }
        Commands::Agent(args) => handle_agent(args).await,
        Commands::Backup {
            volumes,
            force,
            remote,
        } => handle_backup(volumes, force, remote).await,
        Commands::Restore {
            volumes,
            force,
            snapshot,
            remote,
        } => handle_restore(volumes, force, snapshot, remote).await,
        Commands::Volumes { ids, remote } => handle_volumes(ids, remote).await,
        Commands::Info { remote } => handle_info(remote).await,
        Commands::Restic {
            volume,
            args,
            remote,
        } => handle_restic(volume, args, remote).await,
    }
}

#[cfg(feature = "server")]
async fn handle_manager(
    args: bivac::cli::ManagerArgs,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
) -> Result<()> {
    use bivac::core::engine::ProcessRunner;
    use bivac::core::filters::Filters;
    use bivac::core::manager::{Manager, ManagerConfig};
    use bivac::core::providers::Providers;
    use bivac::orchestrators::{
        agent_env, get_orchestrator, CattleConfig, DockerConfig, KubernetesConfig,
        OrchestratorsConfig,
    };
    use bivac::server::{self, auth::generate_token};
    use std::sync::Arc;
    use tracing::warn;

    let providers = Providers::load(&args.providers_config)
        .with_context(|| format!("failed to load providers from {}", args.providers_config.display()))?;

    let config = OrchestratorsConfig {
        docker: DockerConfig {
            endpoint: args.docker_endpoint.clone(),
        },
        kubernetes: KubernetesConfig {
            namespace: args.kubernetes_namespace.clone(),
            all_namespaces: args.kubernetes_all_namespaces,
            kubeconfig: args.kubernetes_kubeconfig.clone(),
            agent_service_account: args.kubernetes_agent_service_account.clone(),
            whitelist_annotation: args.kubernetes_whitelist_annotation,
        },
        cattle: CattleConfig {
            url: args.cattle_url.clone(),
            access_key: args.cattle_access_key.clone(),
            secret_key: args.cattle_secret_key.clone(),
        },
    };
    let orchestrator = get_orchestrator(args.orchestrator.as_deref(), &config)
        .await
        .context("failed to retrieve orchestrator")?;

    let psk = if args.psk.is_empty() {
        let token = generate_token();
        warn!("No pre-shared key configured, using generated key {}", token);
        token
    } else {
        args.psk.clone()
    };

    // agents need the key to post to the log receiver
    let mut env = agent_env(std::env::vars());
    env.retain(|(k, _)| k != "BIVAC_SERVER_PSK");
    env.push(("BIVAC_SERVER_PSK".to_string(), psk.clone()));

    let filters = Filters::new(whitelist, blacklist);
    if !filters.whitelist().is_empty() {
        info!(whitelist = ?filters.whitelist(), "Only backing up whitelisted volumes");
    }
    if !filters.blacklist().is_empty() {
        info!(blacklist = ?filters.blacklist(), "Skipping blacklisted volumes");
    }

    let manager = Arc::new(Manager::new(
        orchestrator,
        providers,
        filters,
        ManagerConfig {
            target_url: args.target_url.clone(),
            agent_image: args.agent_image.clone(),
            log_server: args.log_server.clone().filter(|s| !s.is_empty()),
            backup_interval: args.backup_interval,
            refresh_rate: args.refresh_rate,
            default_preferred_time: args.default_preferred_time.clone(),
            agent_env: env,
            server_address: args.server_address.clone(),
            seed_from_repository: true,
        },
        Arc::new(ProcessRunner),
    )?);

    let orchestrator_name = manager.info().await.orchestrator;
    info!(orchestrator = %orchestrator_name, "Bivac {} managing volumes", bivac::cli::get_version());
    tokio::spawn(manager.clone().run());
    server::run(manager, &args.server_address, psk).await
}

async fn handle_agent(args: AgentArgs) -> Result<i32> {
    let action = match args.kind {
        AgentKind::Backup => AgentAction::Backup {
            retention: retention_args(&args.retention),
            verify: args.verify,
        },
        AgentKind::Restore => AgentAction::Restore {
            snapshot: args.snapshot.clone(),
        },
        AgentKind::Restic => AgentAction::Restic {
            argv: args.args.clone(),
        },
    };
    let opts = AgentOptions {
        backup_path: args.backup_path,
        hostname: args.host,
        force: args.force,
        log_receiver: args.log_receiver,
        psk: args.psk,
    };

    let envelope = agent::run(Engine::new(&args.target_url), action, opts).await?;
    Ok(if envelope.is_success() { 0 } else { 1 })
}

fn spinner(msg: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
        pb.set_style(style);
    }
    pb.set_message(msg);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn colored_status(status: BackupStatus) -> String {
    match status {
        BackupStatus::Success => status.to_string().green().to_string(),
        BackupStatus::Failed => status.to_string().red().bold().to_string(),
        BackupStatus::Unknown => status.to_string().yellow().to_string(),
    }
}

fn print_volume(v: &Volume) {
    println!("{} {}", "ID:".bold(), v.id);
    println!("{} {}", "Name:".bold(), v.name);
    println!("{} {}", "Hostname:".bold(), v.hostname);
    println!("{} {}", "Mountpoint:".bold(), v.mountpoint);
    println!(
        "{} {}",
        "Backup date:".bold(),
        format_backup_date(v.last_backup_date, Local::now())
    );
    println!("{} {}", "Backup status:".bold(), colored_status(v.last_backup_status));
    println!("{}", "Logs:".bold());
    for (step, log) in &v.logs {
        println!("\t{}\t{}", step, log.replace('\n', "\n\t\t"));
    }
}

async fn connect(remote: &RemoteArgs) -> Result<BivacClient> {
    BivacClient::new(&remote.remote_address, &remote.psk)
        .await
        .with_context(|| format!("failed to connect to {}", remote.remote_address))
}

fn print_requested(volumes: &[Volume], requested: &[String]) {
    for r in requested {
        if let Some(v) = volumes.iter().find(|v| v.matches(r)) {
            print_volume(v);
        }
    }
}

async fn handle_backup(volumes: Vec<String>, force: bool, remote: RemoteArgs) -> Result<i32> {
    let client = connect(&remote).await?;

    for volume in &volumes {
        let pb = spinner(format!("Backing up `{}'...", volume));
        let done = client
            .backup_volume(volume, force)
            .await
            .with_context(|| format!("failed to backup volume {}", volume))?;
        pb.finish_and_clear();
        if !done {
            println!("{} is already being backed up", volume.yellow());
        }
    }

    let managed = client.get_volumes().await.context("failed to get volumes")?;
    print_requested(&managed, &volumes);
    Ok(0)
}

async fn handle_restore(
    volumes: Vec<String>,
    force: bool,
    snapshot: String,
    remote: RemoteArgs,
) -> Result<i32> {
    let client = connect(&remote).await?;

    for volume in &volumes {
        let pb = spinner(format!("Restoring `{}' from {}...", volume, snapshot));
        let done = client
            .restore_volume(volume, force, &snapshot)
            .await
            .with_context(|| format!("failed to restore volume {}", volume))?;
        pb.finish_and_clear();
        if !done {
            println!("{} is busy, try again later", volume.yellow());
        }
    }

    let managed = client.get_volumes().await.context("failed to get volumes")?;
    print_requested(&managed, &volumes);
    Ok(0)
}

async fn handle_volumes(ids: Vec<String>, remote: RemoteArgs) -> Result<i32> {
    let client = connect(&remote).await?;
    let volumes = client.get_volumes().await.context("failed to get volumes")?;

    if !ids.is_empty() {
        print_requested(&volumes, &ids);
        return Ok(0);
    }

    println!(
        "{:<20} {:<30} {:<20} {:<35} {:<40} {:<10}",
        "ID", "Name", "Hostname", "Mountpoint", "LastBackupDate", "LastBackupStatus"
    );
    println!("{}", "-".repeat(160));
    let now = Local::now();
    for v in &volumes {
        println!(
            "{:<20} {:<30} {:<20} {:<35} {:<40} {:<10}",
            truncate_string(&v.id, 20),
            truncate_string(&v.name, 30),
            truncate_string(&v.hostname, 20),
            truncate_string(&v.mountpoint, 35),
            format_backup_date(v.last_backup_date, now),
            colored_status(v.last_backup_status)
        );
    }
    Ok(0)
}

async fn handle_info(remote: RemoteArgs) -> Result<i32> {
    let client = connect(&remote).await?;
    let info = client
        .get_informations()
        .await
        .context("failed to get informations")?;

    println!("{} {}", "Version:".bold(), info.version);
    println!("{} {}", "Build date:".bold(), info.build_date);
    println!("{} {}", "Orchestrator:".bold(), info.orchestrator);
    println!("{} {}", "Address:".bold(), info.address);
    println!("{} {}", "Managed volumes:".bold(), info.managed_volumes);
    Ok(0)
}

async fn handle_restic(volume: String, args: Vec<String>, remote: RemoteArgs) -> Result<i32> {
    let client = connect(&remote).await?;
    let output = client
        .run_raw_command(&volume, &args)
        .await
        .context("failed to run command")?;
    println!("{}", output);
    Ok(0)
}
