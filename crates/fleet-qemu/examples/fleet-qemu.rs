use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use fleet::{Cluster, DiskSpec, Flight, MachineOptions, RuntimeConfig, UserData, new_machines};
use fleet_qemu::{QemuFlight, QemuFlightConfig};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "fleet-qemu")]
struct Cli {
    /// YAML file with `flight`, `cluster` and `machine` sections
    #[arg(long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot machines, run a command on each, then tear everything down
    Run {
        /// Command to run on every machine
        cmd: String,
        /// Number of machines
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Boot payload (Ignition JSON, cloud-config or script)
        #[arg(long)]
        userdata: Option<PathBuf>,
        /// Extra disk, e.g. `5G:serial=data` or `base.img+2G` (single machine only)
        #[arg(long = "disk")]
        disks: Vec<String>,
        /// Reboot every machine before running the command
        #[arg(long)]
        reboot: bool,
        /// Keep machines running until Ctrl-C
        #[arg(long)]
        hold: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    flight: QemuFlightConfig,
    cluster: RuntimeConfig,
    machine: MachineOptions,
}

impl DemoConfig {
    async fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        let mut config: Self = serde_yaml_ng::from_str(&text)
            .map_err(|e| format!("parse {}: {e}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.flight.resolve_paths(dir);
            if config.cluster.output_dir.is_relative() {
                config.cluster.output_dir = dir.join(&config.cluster.output_dir);
            }
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if !nix::unistd::geteuid().is_root() {
        eprintln!("error: fleet-qemu must run as root (it creates network namespaces)");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    let config = match DemoConfig::load(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run {
            cmd,
            count,
            userdata,
            disks,
            reboot,
            hold,
        } => run(config, &cmd, count, userdata, disks, reboot, hold).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(
    config: DemoConfig,
    cmd: &str,
    count: usize,
    userdata: Option<PathBuf>,
    disks: Vec<String>,
    reboot: bool,
    hold: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let userdata = match userdata {
        Some(path) => Some(UserData::parse(&tokio::fs::read_to_string(&path).await?)?),
        None => None,
    };
    let mut options = config.machine;
    for disk in &disks {
        options.extra_disks.push(DiskSpec::parse(disk)?);
    }

    let flight = QemuFlight::new(config.flight).await?;
    println!("flight:  {}", flight.name());

    let outcome: Result<(), Box<dyn std::error::Error>> = async {
        let cluster = flight.new_cluster(config.cluster).await?;
        let result = exercise(&cluster, userdata, options, count, cmd, reboot, hold).await;
        for (id, console) in cluster.console_outputs() {
            println!("console: {id}: {} bytes", console.len());
        }
        cluster.destroy().await;
        result
    }
    .await;

    flight.destroy().await;
    outcome
}

async fn exercise(
    cluster: &Arc<dyn Cluster>,
    userdata: Option<UserData>,
    options: MachineOptions,
    count: usize,
    cmd: &str,
    reboot: bool,
    hold: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let machines = if count == 1 {
        vec![
            cluster
                .new_machine_with_options(userdata, options)
                .await?,
        ]
    } else {
        new_machines(Arc::clone(cluster), userdata, count).await?
    };

    for machine in &machines {
        if reboot {
            machine.reboot().await?;
        }
        let out = machine.ssh(cmd).await?;
        println!("machine: {} ({})", machine.id(), machine.ip());
        println!("status:  {:?}", out.status);
        print!("{}", out.stdout);
        eprint!("{}", out.stderr);
    }

    if hold {
        println!("holding machines; press Ctrl-C to tear down");
        tokio::signal::ctrl_c().await?;
    }

    for machine in &machines {
        machine.destroy().await;
        println!("journal: {} ({} bytes)", machine.id(), machine.journal_output().len());
    }
    Ok(())
}
