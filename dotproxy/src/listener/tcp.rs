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

//! One client request per accepted TCP connection: read one framed
//! message, run the `Forwarder`, write one framed reply, close.

use dotproxy_core::{BoundedSocket, Dialer, DnsFramer, Forwarder, StatsSink, Transport, UpstreamPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept connections on `addr` until the process is asked to shut down.
/// Each accepted connection is handled on its own task so a slow upstream
/// never blocks other clients.
pub async fn serve<D: Dialer>(
    addr: SocketAddr,
    pool: Arc<UpstreamPool<D>>,
    stats: Option<Arc<StatsSink>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("TCP listener bound to {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("TCP accept failed: {}", e);
                continue;
            }
        };

        let pool = pool.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &pool, stats.as_deref()).await {
                log::debug!("TCP connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection<D: Dialer>(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    pool: &UpstreamPool<D>,
    stats: Option<&StatsSink>,
) -> anyhow::Result<()> {
    let mut socket = BoundedSocket::new(stream, peer.to_string());
    let request = DnsFramer::recv(&mut socket).await?;
    let reply = Forwarder::forward(&request, Transport::Tcp, pool, stats).await;
    DnsFramer::send(&mut socket, &reply).await?;
    Ok(())
}
