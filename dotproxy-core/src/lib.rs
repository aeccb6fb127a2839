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

#![deny(unsafe_code)]
//! This is the core library for dotproxy. It implements the bounded socket
//! primitive, the framed DNS-over-TCP codec, the TLS upstream connection
//! pool with blacklisting, and the per-request forwarding state machine.
//! Front-end listeners and CLI plumbing live in the `dotproxy` binary crate.

pub mod forwarder;
pub mod framer;
pub mod pool;
pub mod socket;
pub mod stats;

pub use forwarder::{Forwarder, ForwarderError, Transport};
pub use framer::{DnsFramer, FramerError};
pub use pool::{BlacklistEntry, Dialer, PoolError, TlsDialer, UpstreamAddress, UpstreamPool};
pub use socket::{BoundedSocket, SocketError};
pub use stats::{StatsEvent, StatsSink};

/// Maximum DNS message size under the 2-byte length prefix (RFC 1035 §4.2.2).
pub const MAX_MESSAGE_LEN: usize = 65535;
