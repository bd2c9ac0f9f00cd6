//! `xiron` – command line for the Xiron telemetry/command bus.
//!
//! ```bash
//! # Simulator side: accept bridge peers (with stub pose/scan answers)
//! xiron serve --stub-sim
//!
//! # Control side
//! xiron send-vel robot0 0.5 0.1 --repeat 20 --interval-ms 100
//! xiron pose robot0
//! xiron watch-pose robot0 --hz 5
//! xiron watch robot0 --scan
//! xiron echo vel
//! ```
//!
//! Settings come from `~/.xiron/config.toml` (see `xiron config init`) with
//! `XIRON_*` environment overrides.

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use xiron_bus::{
    BusConfig, CommandClient, DeliveryMode, Dispatcher, GET_POSE, GET_SCAN, RpcResponder, SubscriptionHandle,
    SubscriptionState, WsBridge, WsLink, broker_from_config,
};
use xiron_types::{BusError, LaserScan, Pose, PoseRequest, RobotId, Topic};

#[derive(Parser, Debug)]
#[command(name = "xiron")]
#[command(about = "Command and telemetry bus for Xiron robot simulations", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default `~/.xiron/config.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept bridge peers until Ctrl-C
    Serve {
        /// Listen address (overrides `bridge_addr`)
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Answer pose/scan queries with a robot parked at the origin
        #[arg(long)]
        stub_sim: bool,
    },

    /// Send a unicycle velocity command
    #[command(allow_negative_numbers = true)]
    SendVel {
        robot: String,
        /// Forward speed (m/s)
        v: f64,
        /// Turn rate (rad/s)
        w: f64,
        /// Number of times to send the command
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Delay between repeats
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },

    /// Query a robot's pose once
    Pose { robot: String },

    /// Query a robot's latest laser scan once
    Scan { robot: String },

    /// Poll a robot's pose until Ctrl-C
    WatchPose {
        robot: String,
        #[arg(long, default_value_t = 2.0)]
        hz: f64,
    },

    /// Print a robot's published pose (or scan) telemetry until Ctrl-C
    Watch {
        robot: String,
        /// Follow the scan topic instead of the pose topic
        #[arg(long)]
        scan: bool,
    },

    /// Print every frame seen on a topic until Ctrl-C
    Echo { topic: String },

    /// Config file management
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("xiron");
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} failed to start runtime: {e}", "error:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BusError> {
    let path = cli.config.unwrap_or_else(config::config_path);

    if let Commands::Config(cmd) = &cli.command {
        return run_config(cmd, &path);
    }

    let cfg = config::load_effective(&path)?;
    match cli.command {
        Commands::Serve { addr, stub_sim } => serve(&cfg, addr, stub_sim).await,
        Commands::SendVel {
            robot,
            v,
            w,
            repeat,
            interval_ms,
        } => send_vel(&cfg, RobotId::new(robot)?, v, w, repeat, Duration::from_millis(interval_ms)).await,
        Commands::Pose { robot } => {
            let (client, _link) = connect(&cfg).await?;
            let pose = client.get_pose(&RobotId::new(robot)?).await?;
            print_pose(&pose);
            Ok(())
        }
        Commands::Scan { robot } => {
            let (client, _link) = connect(&cfg).await?;
            let scan = client.get_scan(&RobotId::new(robot)?).await?;
            println!("{}", serde_json::to_string_pretty(&scan)?);
            Ok(())
        }
        Commands::WatchPose { robot, hz } => watch_pose(&cfg, RobotId::new(robot)?, hz).await,
        Commands::Watch { robot, scan } => watch_telemetry(&cfg, RobotId::new(robot)?, scan).await,
        Commands::Echo { topic } => echo(&cfg, Topic::new(topic)?).await,
        Commands::Config(_) => Ok(()),
    }
}

fn run_config(cmd: &ConfigCommand, path: &std::path::Path) -> Result<(), BusError> {
    match cmd {
        ConfigCommand::Show => {
            let cfg = config::load_effective(path)?;
            let text = toml::to_string_pretty(&cfg).map_err(|e| BusError::Config(e.to_string()))?;
            println!("{} {}", "#".dimmed(), path.display().to_string().dimmed());
            print!("{text}");
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(BusError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_to(&BusConfig::default(), path)?;
            println!("{} wrote {}", "✓".green(), path.display());
        }
    }
    Ok(())
}

/// Local broker joined to the configured bridge, with a command client on it.
/// The link stays up while the returned [`WsLink`] lives.
async fn connect(cfg: &BusConfig) -> Result<(CommandClient, WsLink), BusError> {
    let broker = broker_from_config(cfg)?;
    let link = WsLink::connect(&cfg.bridge_url, broker.clone()).await?;
    let client = CommandClient::from_config(broker, cfg)?;
    Ok((client, link))
}

async fn serve(cfg: &BusConfig, addr: Option<SocketAddr>, stub_sim: bool) -> Result<(), BusError> {
    let addr = match addr {
        Some(a) => a,
        None => cfg
            .bridge_addr
            .parse()
            .map_err(|e| BusError::Config(format!("bad bridge_addr {:?}: {e}", cfg.bridge_addr)))?,
    };
    let broker = broker_from_config(cfg)?;

    let _responders = if stub_sim {
        Some(stub_responders(broker.clone())?)
    } else {
        None
    };

    let bridge = WsBridge::bind(broker, addr).await?;
    println!("{} bridge listening on {}", "✓".green(), bridge.local_addr()?);

    tokio::select! {
        result = bridge.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "shutting down".yellow());
            Ok(())
        }
    }
}

fn stub_responders(broker: xiron_bus::Broker) -> Result<(RpcResponder, RpcResponder), BusError> {
    let pose = RpcResponder::serve(broker.clone(), GET_POSE, |req: PoseRequest| {
        Ok::<_, String>(Pose {
            robot_id: req.id,
            position: (0.0, 0.0),
            orientation: 0.0,
        })
    })?;
    let scan = RpcResponder::serve(broker, GET_SCAN, |req: PoseRequest| {
        Ok::<_, String>(LaserScan {
            robot_id: req.id,
            angle_min: 0.0,
            angle_max: 0.0,
            count: 0,
            values: Vec::new(),
        })
    })?;
    info!("stub simulator answering {GET_POSE} and {GET_SCAN}");
    Ok((pose, scan))
}

async fn send_vel(
    cfg: &BusConfig,
    robot: RobotId,
    v: f64,
    w: f64,
    repeat: u32,
    interval: Duration,
) -> Result<(), BusError> {
    let (client, link) = connect(cfg).await?;
    for i in 0..repeat {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        client.set_velocity(&robot, v, w)?;
    }
    // Let the relay flush before closing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    link.close().await?;
    println!("{} sent v={v} w={w} to {robot} x{repeat}", "✓".green());
    Ok(())
}

async fn watch_pose(cfg: &BusConfig, robot: RobotId, hz: f64) -> Result<(), BusError> {
    let broker = broker_from_config(cfg)?;
    let _link = WsLink::connect(&cfg.bridge_url, broker.clone()).await?;
    let dispatcher = Dispatcher::from_config(broker, cfg);

    let handle = dispatcher.subscribe(
        robot,
        Topic::new(GET_POSE)?,
        DeliveryMode::Poll { frequency_hz: hz },
        |pose: Pose| print_pose(&pose),
    )?;
    follow(&dispatcher, &handle).await
}

async fn watch_telemetry(cfg: &BusConfig, robot: RobotId, scan: bool) -> Result<(), BusError> {
    let broker = broker_from_config(cfg)?;
    let _link = WsLink::connect(&cfg.bridge_url, broker.clone()).await?;
    let dispatcher = Dispatcher::from_config(broker, cfg);

    let handle = start_watch(&dispatcher, cfg, robot, scan)?;
    println!("{} watching {}", "✓".green(), handle.topic().as_str().cyan());
    follow(&dispatcher, &handle).await
}

/// Push subscription on the configured pose or scan topic.
fn start_watch(
    dispatcher: &Dispatcher,
    cfg: &BusConfig,
    robot: RobotId,
    scan: bool,
) -> Result<SubscriptionHandle, BusError> {
    if scan {
        dispatcher.subscribe(robot, cfg.scan_topic()?, DeliveryMode::Push, |scan: LaserScan| {
            println!(
                "{} {} beams [{:.2}, {:.2}] rad",
                scan.robot_id.as_str().bold(),
                scan.count,
                scan.angle_min,
                scan.angle_max
            );
        })
    } else {
        dispatcher.subscribe(robot, cfg.pose_topic()?, DeliveryMode::Push, |pose: Pose| print_pose(&pose))
    }
}

/// Wait for Ctrl-C or for the subscription to end, then stop everything.
async fn follow(dispatcher: &Dispatcher, handle: &SubscriptionHandle) -> Result<(), BusError> {
    let outcome = tokio::select! {
        state = handle.wait() => state,
        _ = tokio::signal::ctrl_c() => SubscriptionState::Stopped,
    };
    dispatcher.shutdown().await;

    match outcome {
        SubscriptionState::Failed(e) => Err(e),
        _ => Ok(()),
    }
}

async fn echo(cfg: &BusConfig, topic: Topic) -> Result<(), BusError> {
    let broker = broker_from_config(cfg)?;
    let mut rx = broker.subscribe(&topic);
    let link = WsLink::connect(&cfg.bridge_url, broker).await?;
    println!("{} listening on {}", "✓".green(), topic.as_str().cyan());

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(frame) => println!("{} {}", frame.topic.as_str().cyan(), frame.body),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "echo fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !link.is_connected() {
            return Err(xiron_types::TransportError::Closed.into());
        }
    }
    link.close().await
}

fn print_pose(pose: &Pose) {
    println!(
        "{} x={:.3} y={:.3} θ={:.3}",
        pose.robot_id.as_str().bold(),
        pose.position.0,
        pose.position.1,
        pose.orientation
    );
}
