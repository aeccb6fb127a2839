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

//! Command-line / environment-variable configuration surface, matching
//! the original proxy's flag and env-var names one-for-one.

use dotproxy_core::UpstreamAddress;
use std::net::IpAddr;
use std::str::FromStr;
use structopt::StructOpt;
use thiserror::Error;

/// Errors raised while validating parsed CLI input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid nameserver spec {0:?}: expected <ip>:<port>:<cn>")]
    InvalidNameserver(String),
    #[error("invalid port number {0}: must be between 1 and 65535")]
    InvalidPort(u32),
    #[error("at least one listener must be enabled, via --tcp and/or --udp")]
    NoListenerEnabled,
}

/// One `ip:port:cn` entry from `-n`/`--nameserver`. Implements `FromStr` so
/// `structopt` can parse each occurrence directly; comma-separated
/// nameservers within a single occurrence are split out by the caller.
#[derive(Debug, Clone)]
pub struct NameserverArg(pub Vec<UpstreamAddress>);

impl FromStr for NameserverArg {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addrs = Vec::new();
        for entry in s.split(',') {
            let parts: Vec<&str> = entry.split(':').collect();
            let [ip, port, cn] = parts.as_slice() else {
                return Err(ConfigError::InvalidNameserver(entry.to_string()));
            };
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| ConfigError::InvalidNameserver(entry.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::InvalidNameserver(entry.to_string()))?;
            addrs.push(UpstreamAddress::new(ip, port, *cn));
        }
        Ok(NameserverArg(addrs))
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dotproxy",
    about = "Rule-free DNS-over-TLS forwarding proxy"
)]
pub struct Opt {
    /// Set the nameservers to forward DNS-over-TLS queries to. Repeat to
    /// add more, or separate multiple within one occurrence with commas.
    #[structopt(
        short = "n",
        long = "nameserver",
        env = "NAMESERVERS",
        value_name = "ip:port:cn",
        required = true
    )]
    pub nameservers: Vec<NameserverArg>,

    /// Write logs to this file instead of stderr.
    #[structopt(short = "l", long = "logfile", env = "LOGFILE")]
    pub logfile: Option<String>,

    /// Enable verbose (info-level) logging.
    #[structopt(short = "v", long = "verbose", env = "VERBOSE")]
    pub verbose: bool,

    /// Enable debug logging. Takes precedence over `--verbose`.
    #[structopt(short = "d", long = "debug", env = "DEBUG")]
    pub debug: bool,

    /// Enable the TCP listener.
    #[structopt(short = "t", long = "tcp", env = "ENABLE_TCP")]
    pub tcp: bool,

    /// Enable the UDP listener.
    #[structopt(short = "u", long = "udp", env = "ENABLE_UDP")]
    pub udp: bool,

    /// Enable periodic stats logging.
    #[structopt(short = "s", long = "stats", env = "ENABLE_STATS")]
    pub stats: bool,

    /// Port number to listen on for DNS queries.
    #[structopt(short = "p", long = "port", env = "PORT", default_value = "15353")]
    pub port: u32,

    /// Size of the per-address-set upstream connection pool.
    #[structopt(long = "pool-size", env = "POOL_SIZE", default_value = "5")]
    pub pool_size: usize,
}

impl Opt {
    /// Flatten and validate the parsed options, applying the same checks
    /// (and the same "`tcp`/`udp` default on" fallback when neither flag
    /// nor env var set them) as the original `main.py`.
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        if self.port == 0 || self.port > u16::MAX as u32 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        // Neither `-t`/`-u` supplied at all defaults both listeners on,
        // matching `main.py`'s `default=True` behavior for both flags.
        let explicit_listener = self.tcp || self.udp;
        let (tcp, udp) = if explicit_listener {
            (self.tcp, self.udp)
        } else {
            (true, true)
        };
        if !tcp && !udp {
            return Err(ConfigError::NoListenerEnabled);
        }

        // `-s`/`--stats`/`ENABLE_STATS` is "default on" per the CLI table,
        // the same as `-t`/`-u`. Unlike `tcp`/`udp` there's no sibling flag
        // to pair with for an absence check, and (same as `main.py`'s
        // `default=True` store_true definition) there is no corresponding
        // "disable" flag either, so it is unconditionally enabled.
        let stats = true;

        let nameservers: Vec<UpstreamAddress> = self
            .nameservers
            .into_iter()
            .flat_map(|n| n.0)
            .collect();

        Ok(ResolvedConfig {
            nameservers,
            logfile: self.logfile,
            level: if self.debug {
                log::LevelFilter::Debug
            } else if self.verbose {
                log::LevelFilter::Info
            } else {
                log::LevelFilter::Warn
            },
            tcp,
            udp,
            stats,
            port: self.port as u16,
            pool_size: self.pool_size,
        })
    }
}

/// Validated, flattened configuration ready to build the proxy from.
pub struct ResolvedConfig {
    pub nameservers: Vec<UpstreamAddress>,
    pub logfile: Option<String>,
    pub level: log::LevelFilter,
    pub tcp: bool,
    pub udp: bool,
    pub stats: bool,
    pub port: u16,
    pub pool_size: usize,
}
