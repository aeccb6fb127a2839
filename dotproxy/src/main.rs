// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod cli;
mod listener;
mod logging;

use cli::{ConfigError, Opt};
use dotproxy_core::{pool::DEFAULT_CONNECT_TIMEOUT, pool::DEFAULT_NETWORK_TIMEOUT, StatsSink, TlsDialer, UpstreamPool};
use log::*;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use structopt::StructOpt;

const PROJECT_NAME: &str = "dotproxy";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    // `--version` is handled before full validation, mirroring
    // `configargparse`'s mutually-exclusive-group short-circuit in the
    // original `main.py`.
    if std::env::args().any(|a| a == "--version") {
        println!("{} {}", PROJECT_NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    let opt = Opt::from_args();
    let config = match opt.resolve() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(config.level, config.logfile.as_deref()) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: cli::ResolvedConfig) -> anyhow::Result<()> {
    info!("{} {} starting", PROJECT_NAME, VERSION);

    if config.nameservers.is_empty() {
        return Err(ConfigError::NoListenerEnabled.into());
    }

    let pool = Arc::new(UpstreamPool::new(
        config.nameservers,
        config.pool_size,
        DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_NETWORK_TIMEOUT,
        TlsDialer::new(),
    ));

    let stats = if config.stats {
        Some(Arc::new(StatsSink::spawn()))
    } else {
        None
    };

    let addr = SocketAddr::new(std::net::IpAddr::from([0, 0, 0, 0]), config.port);

    let mut listeners = Vec::new();
    if config.tcp {
        listeners.push(tokio::spawn(listener::tcp::serve(
            addr,
            pool.clone(),
            stats.clone(),
        )));
    }
    if config.udp {
        listeners.push(tokio::spawn(listener::udp::serve(
            addr,
            pool.clone(),
            stats.clone(),
        )));
    }

    info!("{} ready", PROJECT_NAME);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    Ok(())
}

/// Waits for SIGTERM or SIGINT (Ctrl-C). In-flight requests are not
/// forcibly cancelled; the process exits once this future resolves, which
/// matches §5's "stop accepting new work, let in-flight work finish or
/// time out naturally" contract as far as a single-binary process can
/// without a dedicated drain phase.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
