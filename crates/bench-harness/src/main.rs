//! bench-harness: run workload containers on pooled benchmark machines

use anyhow::{Context, Result};
use bench_harness::config::HarnessConfig;
use bench_harness::{
    with_machines, CloudProducer, ContainerOptions, ContainerParams, HarnessError, MachinePool,
    MachineProducer, MachineSettings,
};
use bench_harness_common::PoolSpec;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bench-harness")]
#[command(about = "Run benchmark workloads in containers on pooled machines")]
#[command(version)]
struct Args {
    /// Harness configuration (JSON)
    #[arg(long, global = true, env = "BENCH_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct PoolArgs {
    /// Pool specification (YAML); a single local machine when omitted
    #[arg(long)]
    pool: Option<PathBuf>,

    /// Use at most this many machines from the pool specification
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    pool: PoolArgs,

    /// Workload directory name under the workloads root
    #[arg(short, long)]
    workload: String,

    /// Environment variable for the workload, as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// OCI runtime (defaults to the configured runtime)
    #[arg(long)]
    runtime: Option<String>,

    /// Append the container's stderr to the printed output
    #[arg(long)]
    capture_stderr: bool,
}

#[derive(Subcommand, Debug)]
enum VmCommand {
    /// Create instances and print their names
    Create {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Delete instances by name
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire every machine in a pool, run `uname -a` on each and release them
    Check {
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Build a workload on one machine and run it once
    Run(Box<RunArgs>),

    /// Manage cloud instances directly
    Vm {
        #[command(subcommand)]
        command: VmCommand,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprint!("{}", render_error(&e));
        std::process::exit(1);
    }
}

/// One line per error in the chain, plus the backtrace when one was captured.
fn render_error(e: &anyhow::Error) -> String {
    let mut out = format!("bench-harness: {e}\n");
    for cause in e.chain().skip(1) {
        out.push_str(&format!("  because: {cause}\n"));
    }
    let backtrace = e.backtrace();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        out.push_str(&format!("{backtrace}\n"));
    }
    out
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = HarnessConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Check { pool } => handle_check(&config, pool).await?,
        Command::Run(run_args) => handle_run(&config, *run_args).await?,
        Command::Vm { command } => handle_vm(&config, command).await?,
    }

    Ok(())
}

async fn build_pool(config: &HarnessConfig, args: &PoolArgs) -> Result<MachinePool> {
    let Some(path) = &args.pool else {
        return Ok(MachinePool::local(1, MachineSettings::from(config)));
    };

    let mut spec = PoolSpec::load(path)?;
    if let Some(limit) = args.limit {
        spec = spec.truncate(limit);
    }
    info!(path = %path.display(), machines = spec.len(), "Building machine pool");
    MachinePool::from_spec(spec, config, None)
        .await
        .with_context(|| format!("Failed to build pool from {}", path.display()))
}

/// Handle the check command
async fn handle_check(config: &HarnessConfig, args: PoolArgs) -> Result<()> {
    let pool = build_pool(config, &args).await?;
    let count = pool.capacity();

    with_machines(&pool, count, |machines| async move {
        for machine in &machines {
            let output = machine.checked_run("uname -a").await?;
            println!("{:<20} {}", machine.name(), output.stdout.trim());
        }
        Ok::<_, HarnessError>(())
    })
    .await?;

    println!("\n{count} machine(s) reachable");
    Ok(())
}

/// Handle the run command
async fn handle_run(config: &HarnessConfig, args: RunArgs) -> Result<()> {
    let pool = build_pool(config, &args.pool).await?;

    let output = with_machines(&pool, 1, |machines| async move {
        let machine = &machines[0];
        let tag = machine.pull(&args.workload).await?;

        let mut params = ContainerParams::default().with_options(ContainerOptions {
            capture_stderr: args.capture_stderr,
            ..Default::default()
        });
        if let Some(runtime) = &args.runtime {
            params = params.with_runtime(runtime);
        }

        let env: Vec<(&str, &str)> = args
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        info!(machine = %machine.name(), workload = %tag, "Running workload");
        machine.container(&tag, params).await?.run(&env).await
    })
    .await?;

    print!("{output}");
    Ok(())
}

/// Handle the vm subcommands
async fn handle_vm(config: &HarnessConfig, command: VmCommand) -> Result<()> {
    let producer = CloudProducer::from_config(config).await?;

    match command {
        VmCommand::Create { count } => {
            let machines = producer.get_machines(count).await?;
            for machine in &machines {
                let address = machine
                    .instance()
                    .and_then(|i| i.external_ip())
                    .unwrap_or("-");
                println!("{:<45} {}", machine.name(), address);
            }
        }
        VmCommand::Delete { names } => {
            for name in &names {
                producer.provisioner().delete_instance(name).await?;
                println!("Deleting {name}");
            }
        }
    }

    Ok(())
}
