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

//! The production [`Dialer`]: TCP connect, then a DNS-over-TLS (RFC 7858)
//! handshake verified against the per-upstream configured certificate name,
//! using standard root-CA validation.

use super::{Dialer, UpstreamAddress};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Built once and shared across every dial, same as the teacher's
/// `create_client_config` in its `tls-rustls.rs` qhandle: a root store
/// seeded from the compiled-in Mozilla roots, SNI on, no client
/// authentication.
static SHARED_TLS_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Dials real DNS-over-TLS upstreams.
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    /// Use the shared default TLS configuration (standard root CAs).
    pub fn new() -> Self {
        Self {
            connector: TlsConnector::from(SHARED_TLS_CONFIG.clone()),
        }
    }

    /// Use a caller-supplied TLS configuration, e.g. for pinning a custom
    /// root store in tests or unusual deployments.
    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Conn = TlsStream<TcpStream>;

    async fn dial(
        &self,
        addr: &UpstreamAddress,
        connect_timeout: Duration,
    ) -> io::Result<Self::Conn> {
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(addr.socket_addr()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        let server_name = ServerName::try_from(addr.expected_cert_name.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid certificate name"))?;

        // Peer-name verification against `expected_cert_name` happens
        // inside `connect()` as part of the standard rustls handshake; a
        // mismatch surfaces here as a handshake error, which the pool
        // treats as `DialFailed` and blacklists the address for.
        let tls = tokio::time::timeout(connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;

        Ok(tls)
    }
}
