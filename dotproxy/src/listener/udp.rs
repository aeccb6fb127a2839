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

//! One `Forwarder` run per received datagram, reply sent back via
//! `send_to` on the shared listening socket. No framing prefix on UDP.

use dotproxy_core::{Dialer, Forwarder, StatsSink, Transport, UpstreamPool, MAX_MESSAGE_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Bind `addr` and serve DNS-over-UDP requests until the process is asked
/// to shut down.
pub async fn serve<D: Dialer>(
    addr: SocketAddr,
    pool: Arc<UpstreamPool<D>>,
    stats: Option<Arc<StatsSink>>,
) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    log::info!("UDP listener bound to {}", addr);

    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("UDP recv failed: {}", e);
                continue;
            }
        };

        let request = buf[..len].to_vec();
        let pool = pool.clone();
        let stats = stats.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let reply = Forwarder::forward(&request, Transport::Udp, &pool, stats.as_deref()).await;
            if let Err(e) = socket.send_to(&reply, peer).await {
                log::debug!("UDP send to {} failed: {}", peer, e);
            }
        });
    }
}
