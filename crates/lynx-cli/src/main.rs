mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::LynxConfig;
use lynx_core::Capability;
use lynx_fleet::{AgentRequest, Fleet, SimulatedExecutor, TaskRequest};
use lynx_gateway::GatewayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lynx", about = "Lynx: task distribution for an agent fleet")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "lynx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet and its HTTP/WebSocket gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Simulated work per task attempt
        #[arg(long, default_value_t = 100)]
        work_ms: u64,
    },
    /// Push a synthetic workload through the fleet and print the final snapshot
    Simulate {
        /// Number of tasks to submit
        #[arg(long, default_value_t = 100)]
        tasks: usize,
        /// Agents to spawn when the config declares none
        #[arg(long, default_value_t = 4)]
        agents: usize,
        /// Comma-separated capability lanes
        #[arg(long, default_value = "frontend,backend,database,testing")]
        capabilities: String,
        /// Simulated work per task attempt
        #[arg(long, default_value_t = 20)]
        work_ms: u64,
        /// Fail every n-th attempt
        #[arg(long)]
        fail_every: Option<u64>,
        /// Give up if the workload has not drained by then
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    // the default path may be absent; an explicit one must exist
    let optional = cli.config == PathBuf::from("lynx.toml");
    let config = LynxConfig::load(&cli.config, optional)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            work_ms,
        } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(work_ms)));
            let fleet = Fleet::new(config.fleet, executor)?;
            register_all(&fleet, config.agents)?;
            let distribution = fleet.start();

            let app = GatewayServer::build(fleet.clone());
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;

            info!("Lynx gateway listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    tokio::signal::ctrl_c().await.ok();
                })
                .await?;

            info!("Shutting down fleet");
            fleet.shutdown();
            distribution.await?;
        }
        Commands::Simulate {
            tasks,
            agents,
            capabilities,
            work_ms,
            fail_every,
            timeout_secs,
        } => {
            let lanes: Vec<Capability> = capabilities
                .split(',')
                .map(Capability::new)
                .filter(|c| !c.is_empty())
                .collect();
            anyhow::ensure!(!lanes.is_empty(), "at least one capability lane is required");

            let mut executor = SimulatedExecutor::new(Duration::from_millis(work_ms));
            if let Some(n) = fail_every {
                executor = executor.failing_every(n);
            }
            let executor = Arc::new(executor);
            let fleet = Fleet::new(config.fleet, executor.clone())?;

            let roster = if config.agents.is_empty() {
                anyhow::ensure!(agents > 0, "--agents must be at least 1");
                synthetic_agents(agents, &lanes)
            } else {
                config.agents
            };
            register_all(&fleet, roster)?;
            let distribution = fleet.start();

            for i in 0..tasks {
                let lane = lanes[i % lanes.len()].clone();
                let request = TaskRequest::new(lane, serde_json::json!({ "n": i }))
                    .with_priority((i % 3) as i32);
                fleet.submit_task(request)?;
            }
            info!(tasks, lanes = lanes.len(), "Workload submitted");

            let limit = Duration::from_secs(timeout_secs);
            let drained = wait_until_drained(&fleet, tasks as u64, limit).await;
            fleet.shutdown();
            distribution.await?;
            anyhow::ensure!(drained, "workload did not drain within {timeout_secs}s");

            let report = serde_json::json!({
                "snapshot": fleet.snapshot(),
                "executions": executor.calls(),
                "agents": fleet.agents(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn register_all(fleet: &Fleet, agents: Vec<AgentRequest>) -> anyhow::Result<()> {
    for request in agents {
        let id = fleet.register_agent(request)?;
        info!(agent_id = %id, "Agent registered");
    }
    Ok(())
}

/// Each agent serves two adjacent lanes with a concurrency of 2; every lane
/// is covered once `count * 2 >= lanes.len()`.
fn synthetic_agents(count: usize, lanes: &[Capability]) -> Vec<AgentRequest> {
    (0..count)
        .map(|i| {
            let caps = [
                lanes[(2 * i) % lanes.len()].clone(),
                lanes[(2 * i + 1) % lanes.len()].clone(),
            ];
            AgentRequest::new(caps, 2).with_name(format!("sim-{i}"))
        })
        .collect()
}

async fn wait_until_drained(fleet: &Fleet, total: u64, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    let mut poll = tokio::time::interval(Duration::from_millis(20));
    loop {
        poll.tick().await;
        let counts = fleet.counts();
        if counts.completed + counts.failed + counts.cancelled >= total {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
    }
}
