//! Command-line client/server for the tunnel-core packet engine.
//!
//! Use cases:
//! $ tunnel --mode client --server vpn.example.com --port 11081 --key <PSK> --address 10.0.0.2/24
//! $ tunnel --mode server --port 11081 --key <PSK> --address 10.0.0.1/24 --nat

use std::path::PathBuf;
use std::process::Command;

use clap::Parser;
use mio::{Events, Poll, Token};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod privilege;
mod shutdown;
mod socket;
mod tun_device;

use config::{Config, FileConfig, ModeArg};
use socket::UdpAdapter;
use tun_device::Tun;
use tunnel_core::{Engine, RealClock, TICK_INTERVAL};

/// Top-level CLI error convention: setup failures are collected as plain
/// strings with added context and reported once at the top level.
pub type CliResult<T> = Result<T, String>;

const TUN_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);

#[derive(Parser, Debug)]
#[command(name = "tunnel", version, about = "Obfuscated, encrypted, authenticated UDP tunnel")]
struct Args {
    /// Path to a TOML config file; CLI flags below always override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    mode: Option<ModeArg>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    mtu: Option<usize>,
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    duplicate: Option<bool>,
    /// Client keepalive period in seconds; 0 disables.
    #[arg(long)]
    keepalive: Option<u64>,
    #[arg(long)]
    tun_name: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    route: Option<bool>,
    #[arg(long)]
    nat: Option<bool>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_file_config(self) -> (Option<PathBuf>, FileConfig) {
        let config = FileConfig {
            mode: self.mode,
            server: self.server,
            port: self.port,
            mtu: self.mtu,
            key: self.key,
            duplicate: self.duplicate,
            keepalive: self.keepalive,
            tun_name: self.tun_name,
            address: self.address,
            route: self.route,
            nat: self.nat,
            user: self.user,
            log_level: self.log_level,
        };
        (self.config, config)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> CliResult<()> {
    let args = Args::parse();
    let (config_path, cli_overrides) = args.into_file_config();

    let file_config = match config_path {
        Some(path) => FileConfig::load(&path)?,
        None => FileConfig::default(),
    };

    let config = Config::merge(file_config, cli_overrides)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().with_default_directive(config.log_level.parse().map_err(|e| format!("invalid log_level {:?}: {e}", config.log_level))?).from_env_lossy())
        .init();

    info!(mode = %config.mode, "starting tunnel");

    let peer = match config.mode {
        ModeArg::Client => Some(config.resolve_peer()?),
        ModeArg::Server => None,
    };

    let bind_addr = match config.mode {
        ModeArg::Client => "0.0.0.0:0".parse().unwrap(),
        ModeArg::Server => format!("0.0.0.0:{}", config.port).parse().unwrap(),
    };

    let poll = Poll::new().map_err(|e| format!("failed to create poll: {e}"))?;
    let mut events = Events::with_capacity(128);

    let mut socket = UdpAdapter::bind(bind_addr, &poll, SOCKET_TOKEN).map_err(|e| format!("failed to bind socket: {e}"))?;
    let mut tun = Tun::create(&config.tun_name, &config.address, config.mtu, &poll, TUN_TOKEN)
        .map_err(|e| format!("failed to create tun device {:?}: {e}", config.tun_name))?;

    info!(tun = %config.tun_name, local = ?socket.local_addr().ok(), "interfaces ready");

    if config.mode == ModeArg::Client && config.route {
        setup_route(&config)?;
    }
    if config.mode == ModeArg::Server && config.nat {
        setup_nat(&config, true)?;
    }

    if let Some(user) = config.user.as_deref() {
        privilege::drop_to(user)?;
        info!(user, "dropped privileges");
    }

    let stop = shutdown::install()?;
    let clock = RealClock;

    let engine_config = config.engine_config(peer);
    let mut engine = Engine::new(engine_config, &config.key, &clock).map_err(|e| format!("failed to start engine: {e}"))?;

    let result = event_loop(&mut engine, &mut tun, &mut socket, poll, &mut events, &clock, &stop);

    if config.user.is_some() {
        if let Err(e) = privilege::regain_root() {
            warn!(error = %e, "failed to regain root privileges");
        } else {
            info!("regained root privileges");
        }
    }

    if config.mode == ModeArg::Server && config.nat {
        if let Err(e) = setup_nat(&config, false) {
            warn!(error = %e, "failed to tear down NAT");
        }
    }

    info!("exit");
    result
}

fn event_loop(
    engine: &mut Engine,
    tun: &mut Tun,
    socket: &mut UdpAdapter,
    mut poll: Poll,
    events: &mut Events,
    clock: &RealClock,
    stop: &std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> CliResult<()> {
    use tunnel_core::Clock;

    while !shutdown::requested(stop) {
        poll.poll(events, Some(TICK_INTERVAL)).map_err(|e| format!("poll failed: {e}"))?;

        for event in events.iter() {
            match event.token() {
                TUN_TOKEN => engine.on_tun_ready(tun, socket, clock.now()).map_err(|e| format!("tun handling failed: {e}"))?,
                SOCKET_TOKEN => engine.on_socket_ready(socket, tun).map_err(|e| format!("socket handling failed: {e}"))?,
                _ => {}
            }
        }

        engine.on_tick(clock.now(), socket).map_err(|e| format!("tick failed: {e}"))?;
    }
    Ok(())
}

fn setup_route(config: &Config) -> CliResult<()> {
    let Some(server) = config.server.as_deref() else { return Ok(()) };
    run(Command::new("ip").args(["route", "add", server, "dev", &config.tun_name]))
}

fn setup_nat(config: &Config, enable: bool) -> CliResult<()> {
    let action = if enable { "-A" } else { "-D" };
    run(Command::new("iptables").args(["-t", "nat", action, "POSTROUTING", "-s", &config.address, "-j", "MASQUERADE"]))
}

fn run(command: &mut Command) -> CliResult<()> {
    let status = command.status().map_err(|e| format!("failed to run {command:?}: {e}"))?;
    if !status.success() {
        return Err(format!("{command:?} exited with {status}"));
    }
    Ok(())
}
