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

//! Per-request forwarding: validate the inbound query, acquire a pooled
//! connection, send/recv framed DNS, retry on transport failure up to a
//! fixed bound, and synthesize SERVFAIL on exhaustion or malformed replies.

use crate::framer::{DnsFramer, FramerError};
use crate::pool::{Dialer, PoolError, UpstreamPool};
use crate::stats::{StatsEvent, StatsSink};
use std::time::Instant;
use thiserror::Error;
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable};

/// Maximum number of distinct checkouts attempted per client request.
pub const PROXY_REQUEST_TRIES: usize = 3;

/// Which listener accepted the request this forwarder call is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

/// Internal, per-attempt failure cause. Never surfaced to the forwarder's
/// caller — every attempt failure is retried or, on exhaustion, collapsed
/// into a SERVFAIL reply.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Framer(#[from] FramerError),
}

/// Stateless per-request forwarding logic. One call to `forward` handles
/// exactly one client query.
pub struct Forwarder;

impl Forwarder {
    /// Run the full algorithm in `spec.md` §4.4 and return the bytes to
    /// send back to the client. Always returns a well-formed DNS message —
    /// either the upstream's verbatim reply or a synthesized SERVFAIL.
    pub async fn forward<D: Dialer>(
        request_bytes: &[u8],
        transport: Transport,
        pool: &UpstreamPool<D>,
        stats: Option<&StatsSink>,
    ) -> Vec<u8> {
        let start = Instant::now();

        let query = Message::from_bytes(request_bytes);
        let reply_bytes = match query {
            Err(e) => {
                log::warn!("malformed request ({}), returning SERVFAIL with id=0", e);
                encode_or_fallback(&servfail(0, OpCode::Query))
            }
            Ok(query) => {
                let id = query.id();
                let op_code = query.op_code();
                Self::forward_valid_query(request_bytes, id, op_code, pool).await
            }
        };

        let elapsed = start.elapsed();
        log::info!(
            "{} request completed in {:?}, {} bytes out",
            transport.as_str(),
            elapsed,
            reply_bytes.len()
        );
        if let Some(sink) = stats {
            sink.record(StatsEvent {
                transport,
                response_time: elapsed,
            });
        }

        reply_bytes
    }

    async fn forward_valid_query<D: Dialer>(
        request_bytes: &[u8],
        id: u16,
        op_code: OpCode,
        pool: &UpstreamPool<D>,
    ) -> Vec<u8> {
        let mut upstream_reply = None;

        for attempt in 1..=PROXY_REQUEST_TRIES {
            match Self::attempt(pool, request_bytes).await {
                Ok(bytes) => {
                    upstream_reply = Some(bytes);
                    break;
                }
                Err(e) => {
                    log::debug!(
                        "forwarding attempt {}/{} failed, retrying: {}",
                        attempt,
                        PROXY_REQUEST_TRIES,
                        e
                    );
                }
            }
        }

        match upstream_reply {
            None => {
                log::warn!(
                    "exhausted {} attempts forwarding query id={}, returning SERVFAIL",
                    PROXY_REQUEST_TRIES,
                    id
                );
                encode_or_fallback(&servfail(id, op_code))
            }
            Some(bytes) => match Message::from_bytes(&bytes) {
                // A well-formed SERVFAIL from upstream is proxied
                // verbatim — only malformed replies get rewritten.
                Ok(_) => bytes,
                Err(e) => {
                    log::warn!(
                        "upstream reply for query id={} failed to decode ({}), returning SERVFAIL",
                        id,
                        e
                    );
                    encode_or_fallback(&servfail(id, op_code))
                }
            },
        }
    }

    /// One checkout + send + recv cycle. Discards the connection on any
    /// transport error and never returns it to the pool twice.
    async fn attempt<D: Dialer>(
        pool: &UpstreamPool<D>,
        request_bytes: &[u8],
    ) -> Result<Vec<u8>, ForwarderError> {
        let mut conn = pool.checkout().await?;

        if let Err(e) = DnsFramer::send(&mut conn.socket, request_bytes).await {
            pool.discard(conn).await;
            return Err(e.into());
        }

        match DnsFramer::recv(&mut conn.socket).await {
            Ok(bytes) => {
                pool.return_conn(conn).await;
                Ok(bytes)
            }
            Err(e) => {
                pool.discard(conn).await;
                Err(e.into())
            }
        }
    }
}

/// Build a SERVFAIL reply matching the query id (0 when the query itself
/// could not be parsed), using the DNS library's message builder.
fn servfail(id: u16, op_code: OpCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(op_code);
    msg.set_response_code(ResponseCode::ServFail);
    msg
}

/// Encode `msg`, falling back to a hand-built minimal SERVFAIL header in
/// the (practically unreachable) case that even encoding a bare SERVFAIL
/// message fails. This is the last line of defense behind §7's invariant
/// that the client always receives a well-formed DNS response.
fn encode_or_fallback(msg: &Message) -> Vec<u8> {
    msg.to_bytes().unwrap_or_else(|e| {
        log::error!("failed to encode SERVFAIL reply ({}), using raw fallback", e);
        let mut buf = vec![0u8; 12];
        buf[0..2].copy_from_slice(&msg.id().to_be_bytes());
        buf[2] = 0x81; // QR=1, RD=1
        buf[3] = 0x82; // RA=1, RCODE=2 (SERVFAIL)
        buf
    })
}
