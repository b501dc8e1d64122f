//! The resolution pipeline, one call per inbound query: validate,
//! check the client against the ACL and rate limiter, try the cache,
//! coalesce concurrent identical misses into a single upstream call,
//! and turn whatever happened into a DNS response (or a deliberate
//! silence).

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

use dns_types::protocol::types::*;

use crate::acl::{self, SharedRateLimiter};
use crate::cache::{CacheKey, SharedCache};
use crate::events::{Event, EventBus, QueryRecord};
use crate::forwarder::{AllUpstreamsFailed, ForwardReply, Forwarder};
use crate::settings::Settings;
use crate::MUTEX_POISON_MESSAGE;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Everything known about one inbound query.  Created at ingress,
/// dies once the response is sent (or deliberately not sent).
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub request_id: Uuid,
    pub client: SocketAddr,
    pub transport: Transport,
    pub received_at: Instant,
    pub message: Message,
}

impl QueryContext {
    pub fn new(client: SocketAddr, transport: Transport, message: Message) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client,
            transport,
            received_at: Instant::now(),
            message,
        }
    }
}

type InflightResult = Result<ForwardReply, AllUpstreamsFailed>;

#[derive(Debug, Clone)]
pub struct Resolver {
    cache: SharedCache,
    forwarder: Forwarder,
    rate_limiter: SharedRateLimiter,
    events: EventBus,

    /// One entry per question currently being forwarded.  The first
    /// asker creates the channel and the upstream task; everyone else
    /// subscribes and waits.
    inflight: Arc<Mutex<HashMap<CacheKey, broadcast::Sender<InflightResult>>>>,
}

impl Resolver {
    pub fn new(
        cache: SharedCache,
        forwarder: Forwarder,
        rate_limiter: SharedRateLimiter,
        events: EventBus,
    ) -> Self {
        Self {
            cache,
            forwarder,
            rate_limiter,
            events,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve one query.  `None` means no response should be sent at
    /// all: ACL-blocked clients and QR=1 packets are dropped, not
    /// answered.
    pub async fn resolve(&self, settings: &Settings, ctx: &QueryContext) -> Option<Message> {
        let query = &ctx.message;

        // Do not respond to response messages: an inbound message
        // could spoof its source address / port to match this
        // server's, and so make it respond to itself, which triggers
        // another response, and so on.
        if query.header.is_response {
            return None;
        }

        let client_ip = ctx.client.ip();
        if !acl::client_permitted(&settings.security, client_ip) {
            tracing::debug!(client = %client_ip, "query from blocked network dropped");
            return None;
        }

        let mut response = query.make_response();

        if query.header.opcode != Opcode::Standard {
            response.header.rcode = Rcode::NotImplemented;
            self.publish_record(ctx, &response, false, None, Some("unsupported opcode"));
            return Some(response);
        }

        if query.questions.len() != 1 {
            response.header.rcode = Rcode::FormatError;
            self.publish_record(ctx, &response, false, None, Some("not a single question"));
            return Some(response);
        }
        let question = query.questions[0].clone();

        if !question.qclass.is_in() {
            response.header.rcode = Rcode::Refused;
            self.publish_record(ctx, &response, false, None, Some("class not IN"));
            return Some(response);
        }

        if !self.rate_limiter.try_consume(
            client_ip,
            settings.security.rate_limit_per_ip,
            Instant::now(),
        ) {
            tracing::debug!(client = %client_ip, "rate limit exceeded");
            response.header.rcode = Rcode::Refused;
            self.publish_record(ctx, &response, false, None, Some("rate_limited"));
            return Some(response);
        }

        let key = CacheKey::from_question(&question);

        if let Some(mut cached) = self.cache.lookup(&key) {
            finish_response(&mut cached, query);
            self.publish_record(ctx, &cached, true, None, None);
            return Some(cached);
        }

        let deadline = ctx.received_at + settings.forwarder.query_timeout();
        match self.forward_coalesced(settings, &key, &question, deadline).await {
            Ok(reply) => {
                let mut message = reply.message;
                finish_response(&mut message, query);
                self.publish_record(ctx, &message, false, Some(reply.upstream), None);
                Some(message)
            }
            Err(error) => {
                response.header.rcode = Rcode::ServerFailure;
                self.publish_record(ctx, &response, false, None, Some(&error.to_string()));
                Some(response)
            }
        }
    }

    /// Run the question through the single-flight table: the first
    /// asker spawns the upstream task, later askers for the same key
    /// just wait for its result.  Each waiter still honours its own
    /// deadline.
    async fn forward_coalesced(
        &self,
        settings: &Settings,
        key: &CacheKey,
        question: &Question,
        deadline: Instant,
    ) -> InflightResult {
        let mut rx = {
            let mut inflight = self.inflight.lock().expect(MUTEX_POISON_MESSAGE);
            if let Some(tx) = inflight.get(key) {
                tracing::trace!(%key, "joining in-flight resolution");
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                inflight.insert(key.clone(), tx);
                self.spawn_upstream_query(settings, key.clone(), question.clone(), deadline);
                rx
            }
        };

        match tokio::time::timeout_at(deadline.into(), rx.recv()).await {
            Ok(Ok(result)) => result,
            // sender dropped without a result, or we ran out of time
            Ok(Err(_)) | Err(_) => Err(AllUpstreamsFailed),
        }
    }

    /// The upstream side of the single-flight: detached from any
    /// waiter, so a client disconnect never cancels the query and a
    /// late answer still lands in the cache.
    fn spawn_upstream_query(
        &self,
        settings: &Settings,
        key: CacheKey,
        question: Question,
        deadline: Instant,
    ) {
        let resolver = self.clone();
        let forwarder_settings = settings.forwarder.clone();

        tokio::spawn(async move {
            let outcome = match resolver
                .forwarder
                .forward(&question, &forwarder_settings, deadline)
                .await
            {
                Ok(mut reply) => {
                    // the OPT record is hop-by-hop: what the upstream
                    // advertises to us is not ours to re-advertise
                    strip_opt(&mut reply.message);
                    if matches!(reply.message.header.rcode, Rcode::NoError | Rcode::NameError) {
                        resolver.cache.insert(&key, &reply.message);
                    }
                    Ok(reply)
                }
                Err(error) => Err(error),
            };

            // remove before sending, so anyone who found the entry is
            // already subscribed and cannot miss the result
            let tx = resolver
                .inflight
                .lock()
                .expect(MUTEX_POISON_MESSAGE)
                .remove(&key);
            if let Some(tx) = tx {
                let _ = tx.send(outcome);
            }
        });
    }

    fn publish_record(
        &self,
        ctx: &QueryContext,
        response: &Message,
        cache_hit: bool,
        upstream: Option<SocketAddr>,
        error: Option<&str>,
    ) {
        let (qname, qtype) = match ctx.message.questions.first() {
            Some(question) => (question.name.to_dotted_string(), question.qtype.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };

        self.events.publish(Event::Query(QueryRecord {
            timestamp: Utc::now(),
            request_id: ctx.request_id,
            client: ctx.client.ip(),
            transport: ctx.transport,
            qname,
            qtype,
            rcode: response.header.rcode.to_string(),
            answers: response.answers.len(),
            response_time_ms: ctx.received_at.elapsed().as_secs_f64() * 1000.0,
            cache_hit,
            upstream,
            error: error.map(str::to_owned),
        }));
    }
}

/// Shape a response template (cached or fresh from upstream) for one
/// particular client: their id, their RD flag, our RA.
fn finish_response(response: &mut Message, query: &Message) {
    response.header.id = query.header.id;
    response.header.is_response = true;
    response.header.is_authoritative = false;
    response.header.recursion_desired = query.header.recursion_desired;
    response.header.recursion_available = true;
}

fn strip_opt(message: &mut Message) {
    message
        .additional
        .retain(|rr| rr.rtype_with_data.rtype() != RecordType::OPT);
}
