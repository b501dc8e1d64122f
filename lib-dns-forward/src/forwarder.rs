//! Forwarding queries to upstream resolvers: per-attempt timeouts,
//! failover across the pool, TCP retry when an answer comes back
//! truncated, and verification that a reply actually answers the
//! question we sent.

use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::*;

use crate::events::{Event, EventBus, ServerNotice};
use crate::net::{read_tcp_bytes, send_tcp_bytes};
use crate::settings::ForwarderSettings;
use crate::upstream::{SharedUpstreamPool, Transition};

/// A response from an upstream, and which upstream produced it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ForwardReply {
    pub message: Message,
    pub upstream: SocketAddr,
}

/// No upstream produced a usable reply before the deadline.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AllUpstreamsFailed;

impl fmt::Display for AllUpstreamsFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no upstream answered before the deadline")
    }
}

impl std::error::Error for AllUpstreamsFailed {}

#[derive(Debug, Clone)]
pub struct Forwarder {
    pool: SharedUpstreamPool,
    events: EventBus,
}

impl Forwarder {
    pub fn new(pool: SharedUpstreamPool, events: EventBus) -> Self {
        Self { pool, events }
    }

    /// Resolve a question by asking upstreams, one attempt at a time,
    /// until one answers or the deadline passes.
    ///
    /// Any well-formed reply whose id and question match the query is
    /// a success - NXDOMAIN and NODATA included, since a negative
    /// answer is still an answer.  Timeouts and malformed or
    /// mismatched replies mark the upstream and move on to the next.
    pub async fn forward(
        &self,
        question: &Question,
        settings: &ForwarderSettings,
        deadline: Instant,
    ) -> Result<ForwardReply, AllUpstreamsFailed> {
        let mut tried = Vec::with_capacity(settings.max_attempts as usize);

        for _ in 0..settings.max_attempts {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some(upstream) = self.pool.select(&tried, now) else {
                break;
            };
            tried.push(upstream);

            let mut request = Message::from_question(rand::rng().random(), question.clone());
            request.header.recursion_desired = true;
            let serialised = match request.clone().into_octets() {
                Ok(octets) => octets,
                Err(error) => {
                    tracing::warn!(?error, %question, "could not serialise upstream query");
                    return Err(AllUpstreamsFailed);
                }
            };

            let attempt_timeout = settings.per_attempt_timeout().min(deadline - now);
            let started = Instant::now();

            let reply = match query_udp(upstream, &serialised, attempt_timeout).await {
                Some(reply) if response_matches_request(&request, &reply) => {
                    if reply.header.is_truncated {
                        // the answer exists but did not fit: same
                        // upstream again, over TCP
                        let tcp_budget = settings
                            .per_attempt_timeout()
                            .min(deadline.saturating_duration_since(Instant::now()));
                        match query_tcp(upstream, &serialised, tcp_budget).await {
                            Some(tcp_reply) if response_matches_request(&request, &tcp_reply) => {
                                Some(tcp_reply)
                            }
                            _ => None,
                        }
                    } else {
                        Some(reply)
                    }
                }
                _ => None,
            };

            match reply {
                Some(message) => {
                    self.mark_success(upstream, started.elapsed());
                    return Ok(ForwardReply { message, upstream });
                }
                None => {
                    tracing::debug!(%upstream, %question, "upstream attempt failed");
                    self.mark_failure(upstream);
                }
            }
        }

        Err(AllUpstreamsFailed)
    }

    fn mark_success(&self, upstream: SocketAddr, latency: Duration) {
        if let Some(Transition::Recovered) = self.pool.record_success(upstream, latency) {
            tracing::info!(%upstream, "upstream recovered");
            self.events
                .publish(Event::Server(ServerNotice::UpstreamRecovered { upstream }));
        }
    }

    fn mark_failure(&self, upstream: SocketAddr) {
        if let Some(Transition::Failed) = self.pool.record_failure(upstream, Instant::now()) {
            tracing::warn!(%upstream, "upstream marked failed");
            self.events
                .publish(Event::Server(ServerNotice::UpstreamFailed { upstream }));
        }
    }
}

/// Send a query to an upstream over UDP and await its reply.  `None`
/// for timeouts, socket errors, and unparseable replies; the reply is
/// NOT validated against the request here.
async fn query_udp(upstream: SocketAddr, serialised: &[u8], budget: Duration) -> Option<Message> {
    match timeout(budget, query_udp_notimeout(upstream, serialised)).await {
        Ok(reply) => reply,
        Err(_) => None,
    }
}

async fn query_udp_notimeout(upstream: SocketAddr, serialised: &[u8]) -> Option<Message> {
    let bind_addr = if upstream.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_addr).await.ok()?;
    socket.connect(upstream).await.ok()?;
    socket.send(serialised).await.ok()?;

    let mut buf = vec![0u8; usize::from(UDP_PAYLOAD_MAX)];
    let received = socket.recv(&mut buf).await.ok()?;
    Message::from_octets(&buf[..received]).ok()
}

/// As `query_udp`, over TCP with length-prefix framing.
async fn query_tcp(upstream: SocketAddr, serialised: &[u8], budget: Duration) -> Option<Message> {
    match timeout(budget, query_tcp_notimeout(upstream, serialised)).await {
        Ok(reply) => reply,
        Err(_) => None,
    }
}

async fn query_tcp_notimeout(upstream: SocketAddr, serialised: &[u8]) -> Option<Message> {
    let mut stream = TcpStream::connect(upstream).await.ok()?;
    send_tcp_bytes(&mut stream, serialised).await.ok()?;
    let bytes = read_tcp_bytes(&mut stream).await.ok()?;
    Message::from_octets(bytes.as_ref()).ok()
}

/// Whether a reply is plausibly the answer to a request we sent:
///
/// - the transaction id must match (anything else is a stray or
///   spoofed datagram);
///
/// - it must be a response to the same opcode;
///
/// - the question section must match exactly, so an answer for some
///   other name or type cannot be smuggled into the cache.
///
/// The rcode is deliberately not checked: negative and error
/// responses are still responses.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}
