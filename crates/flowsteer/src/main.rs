//! flowsteer command line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};

use flowsteer::{
    AddPolicy, FlowsteerConfig, MirrorStatus, Orchestrator, PortRange, TrafficSplitPolicy,
};
use flowsteer_common::{LinuxNic, ToolPaths};

/// Hardware flow steering and SR-IOV provisioning for AF_XDP queues
#[derive(Parser, Debug)]
#[command(name = "flowsteer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Report format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Directory for per-interface lock files
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Directory for ownership records
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Behavior when the device rejects a rule
    #[arg(long, value_enum)]
    add_policy: Option<CliAddPolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Steer a UDP port range to a receive queue
    Apply {
        interface: String,
        /// Receive queue the AF_XDP socket is bound to
        #[arg(short, long)]
        queue: u32,
        /// Destination ports, START-END or a single port
        #[arg(short, long)]
        ports: PortRange,
    },
    /// Remove every rule flowsteer owns on an interface
    Teardown {
        interface: String,
        /// Ports to remove when no ownership record exists
        #[arg(short, long)]
        ports: Option<PortRange>,
    },
    /// Show capabilities, rules and VFs of an interface
    Status { interface: String },
    /// SR-IOV virtual functions
    Vf {
        #[command(subcommand)]
        command: VfCommand,
    },
}

#[derive(Subcommand, Debug)]
enum VfCommand {
    /// Enable exactly N VFs and bring them up
    Enable {
        interface: String,
        #[arg(short = 'n', long)]
        count: u32,
        /// Mirror VF A onto VF B, as A:B
        #[arg(long, value_parser = parse_pair)]
        mirror: Option<(u32, u32)>,
    },
    /// Disable all VFs
    Disable { interface: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliAddPolicy {
    FailFast,
    BestEffort,
}

impl From<CliAddPolicy> for AddPolicy {
    fn from(p: CliAddPolicy) -> Self {
        match p {
            CliAddPolicy::FailFast => AddPolicy::FailFast,
            CliAddPolicy::BestEffort => AddPolicy::BestEffort,
        }
    }
}

fn parse_pair(s: &str) -> Result<(u32, u32), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected A:B, got '{}'", s))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid VF index '{}': {}", v, e))
    };
    Ok((parse(a)?, parse(b)?))
}

fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<FlowsteerConfig> {
    let mut config = match &args.config {
        Some(path) => FlowsteerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FlowsteerConfig::default(),
    };
    if let Some(dir) = &args.lock_dir {
        config.lock_dir = dir.clone();
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(policy) = args.add_policy {
        config.add_policy = policy.into();
    }
    config.validate()?;
    Ok(config)
}

fn emit<T: Serialize + std::fmt::Display>(format: OutputFormat, report: &T) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

/// Runs the command; `Ok(false)` means the report describes a failure.
async fn run(args: Args) -> anyhow::Result<bool> {
    let config = load_config(&args)?;
    let nic = LinuxNic::new(ToolPaths::from(&config.tools));
    let orch = Orchestrator::new(&nic, &config);

    match args.command {
        Command::Apply {
            interface,
            queue,
            ports,
        } => {
            let policy = TrafficSplitPolicy::new(interface, queue, ports);
            let result = orch.apply(&policy).await?;
            emit(args.output, &result)?;
            if let Err(e) = result.check() {
                error!("{}", e);
                return Ok(false);
            }
            Ok(true)
        }
        Command::Teardown { interface, ports } => {
            let result = orch.teardown(&interface, ports).await?;
            emit(args.output, &result)?;
            if let Err(e) = result.check() {
                error!("{}", e);
                return Ok(false);
            }
            Ok(true)
        }
        Command::Status { interface } => {
            let status = orch.status(&interface).await?;
            emit(args.output, &status)?;
            Ok(true)
        }
        Command::Vf { command } => match command {
            VfCommand::Enable {
                interface,
                count,
                mirror,
            } => {
                let set = orch.enable_vfs(&interface, count, mirror).await?;
                emit(args.output, &set)?;
                Ok(!matches!(set.mirror, Some(MirrorStatus::Error { .. })))
            }
            VfCommand::Disable { interface } => {
                let set = orch.disable_vfs(&interface).await?;
                emit(args.output, &set)?;
                Ok(true)
            }
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);
    info!("flowsteer {}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("0:1"), Ok((0, 1)));
        assert!(parse_pair("0-1").is_err());
        assert!(parse_pair("a:1").is_err());
    }

    #[test]
    fn test_args_apply() {
        let args = Args::try_parse_from([
            "flowsteer",
            "--add-policy",
            "best-effort",
            "apply",
            "eth0",
            "--queue",
            "3",
            "--ports",
            "8000-8020",
        ])
        .unwrap();
        assert!(matches!(args.add_policy, Some(CliAddPolicy::BestEffort)));
        match args.command {
            Command::Apply {
                interface,
                queue,
                ports,
            } => {
                assert_eq!(interface, "eth0");
                assert_eq!(queue, 3);
                assert_eq!(ports, PortRange::new(8000, 8020));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_args_vf_enable_mirror() {
        let args = Args::try_parse_from([
            "flowsteer", "-o", "json", "vf", "enable", "eth0", "--count", "2", "--mirror", "0:1",
        ])
        .unwrap();
        assert_eq!(args.output, OutputFormat::Json);
        assert!(matches!(
            args.command,
            Command::Vf {
                command: VfCommand::Enable {
                    count: 2,
                    mirror: Some((0, 1)),
                    ..
                }
            }
        ));
    }
}
