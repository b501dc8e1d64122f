use bytes::BytesMut;
use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use dns_forward::acl::{client_permitted, SharedRateLimiter};
use dns_forward::cache::SharedCache;
use dns_forward::events::{CacheNotice, Event, EventBus, ServerNotice};
use dns_forward::forwarder::Forwarder;
use dns_forward::net::{read_tcp_bytes, send_tcp_bytes};
use dns_forward::resolver::{QueryContext, Resolver, Transport};
use dns_forward::settings::Settings;
use dns_forward::upstream::SharedUpstreamPool;
use dns_types::protocol::types::{Message, Rcode, UDP_PAYLOAD_DEFAULT};

mod metrics;
use metrics::*;

/// Arguments for the listen tasks and request handlers.
#[derive(Debug, Clone)]
struct ListenArgs {
    settings_lock: Arc<RwLock<Arc<Settings>>>,
    resolver: Resolver,
    concurrency: Arc<Semaphore>,
}

/// Parse and resolve one raw query, from either transport.
///
/// `None` means no response goes back: the packet was malformed (and
/// policy says drop), a response-bit spoof, or from a blocked client.
/// On success the response comes with the UDP payload budget the
/// client advertised.
async fn handle_raw_message(
    args: &ListenArgs,
    bytes: &[u8],
    client: SocketAddr,
    transport: Transport,
) -> Option<(Message, usize)> {
    let settings = args.settings_lock.read().await.clone();

    if bytes.len() > settings.security.max_query_length {
        tracing::debug!(%client, length = %bytes.len(), "query over maximum length");
        return formerr_for_unparseable(&settings, bytes)
            .map(|response| (response, usize::from(UDP_PAYLOAD_DEFAULT)));
    }

    match Message::from_octets(bytes) {
        Ok(message) => {
            tracing::debug!(message = ?message, "got message");
            let payload_budget = message.udp_payload_size();
            let ctx = QueryContext::new(client, transport, message);
            args.resolver
                .resolve(&settings, &ctx)
                .await
                .map(|response| (response, payload_budget))
        }
        Err(error) => {
            tracing::debug!(%client, ?error, "could not parse query");
            if settings.security.block_malformed_requests {
                None
            } else {
                error
                    .id()
                    .map(Message::make_format_error_response)
                    .map(|response| (response, usize::from(UDP_PAYLOAD_DEFAULT)))
            }
        }
    }
}

/// A FORMERR for a packet we refuse to parse, if policy allows a
/// response and enough octets arrived to carry the id back.
fn formerr_for_unparseable(settings: &Settings, bytes: &[u8]) -> Option<Message> {
    if settings.security.block_malformed_requests || bytes.len() < 2 {
        None
    } else {
        Some(Message::make_format_error_response(u16::from_be_bytes([
            bytes[0], bytes[1],
        ])))
    }
}

/// Patch a raw query into a REFUSED response without parsing it, for
/// load shedding before any real work happens.
fn refuse_raw(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() < 12 {
        return None;
    }
    let mut response = bytes.to_vec();
    response[2] |= 0b1000_0000; // QR
    response[3] = (response[3] & 0b1111_0000) | u8::from(Rcode::Refused);
    Some(response)
}

async fn listen_udp_task(args: ListenArgs, socket: UdpSocket) {
    let queue_depth = {
        let settings = args.settings_lock.read().await;
        settings.server.request_queue_size.max(1)
    };
    let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(queue_depth);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();

                let Ok(permit) = Arc::clone(&args.concurrency).try_acquire_owned() else {
                    DNS_REQUESTS_REFUSED_TOTAL.with_label_values(&[REFUSED_FOR_OVERLOAD]).inc();
                    if let Some(refused) = refuse_raw(bytes.as_ref()) {
                        let _ = reply.try_send((refused, peer));
                    }
                    continue;
                };

                let args = args.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    if let Some((response, payload_budget)) =
                        handle_raw_message(&args, bytes.as_ref(), peer, Transport::Udp).await
                    {
                        match response.clone().into_octets_bounded(payload_budget) {
                            Ok((serialised, truncated)) => {
                                if truncated {
                                    tracing::debug!(?peer, "response truncated to fit datagram");
                                }
                                DNS_RESPONSES_TOTAL
                                    .with_label_values(&[&response.header.rcode.to_string()])
                                    .inc();
                                DNS_RESPONSE_TIME_SECONDS
                                    .with_label_values(&["udp"])
                                    .observe(started.elapsed().as_secs_f64());
                                if let Err(error) = reply.send((serialised, peer)).await {
                                    tracing::debug!(?peer, ?error, "UDP reply queue closed");
                                }
                            }
                            Err(error) => {
                                tracing::warn!(?peer, ?error, "could not serialise response");
                            }
                        }
                    }
                });
            }

            Some((serialised, peer)) = rx.recv() => {
                if let Err(error) = socket.send_to(&serialised, peer).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
        }
    }
}

async fn listen_tcp_task(args: ListenArgs, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(?peer, "TCP connection");
                tokio::spawn(handle_tcp_connection(args.clone(), stream, peer));
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}

/// One task per connection: read length-prefixed queries until the
/// client goes away or the idle timeout fires.  Each query is handled
/// in its own task and responses go out through a writer task in
/// completion order, so a slow resolution never holds up the answers
/// behind it - clients match responses to queries by id.
async fn handle_tcp_connection(args: ListenArgs, stream: TcpStream, peer: SocketAddr) {
    let (idle_timeout, queue_depth, permitted) = {
        let settings = args.settings_lock.read().await;
        (
            settings.server.connection_timeout(),
            settings.server.request_queue_size.max(1),
            client_permitted(&settings.security, peer.ip()),
        )
    };

    // a blocked client's connection is closed, not answered
    if !permitted {
        tracing::debug!(?peer, "connection from blocked network closed");
        return;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(queue_depth);

    let writer = tokio::spawn(async move {
        while let Some(serialised) = reply_rx.recv().await {
            if let Err(error) = send_tcp_bytes(&mut write_half, &serialised).await {
                tracing::debug!(?error, "TCP send error");
                break;
            }
        }
    });

    loop {
        match timeout(idle_timeout, read_tcp_bytes(&mut read_half)).await {
            Err(_) => {
                tracing::debug!(?peer, "TCP connection idle, closing");
                break;
            }
            Ok(Err(error)) => {
                // includes plain EOF; only answer if enough arrived
                // to address a FORMERR
                if let Some(id) = error.id() {
                    tracing::debug!(?peer, ?error, "TCP read error");
                    if let Ok(serialised) = Message::make_format_error_response(id).into_octets() {
                        let _ = reply_tx.send(serialised).await;
                    }
                }
                break;
            }
            Ok(Ok(bytes)) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();

                let Ok(permit) = Arc::clone(&args.concurrency).try_acquire_owned() else {
                    DNS_REQUESTS_REFUSED_TOTAL.with_label_values(&[REFUSED_FOR_OVERLOAD]).inc();
                    if let Some(refused) = refuse_raw(bytes.as_ref()) {
                        let _ = reply_tx.send(refused).await;
                    }
                    continue;
                };

                let args = args.clone();
                let reply = reply_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    if let Some((response, _)) =
                        handle_raw_message(&args, bytes.as_ref(), peer, Transport::Tcp).await
                    {
                        match response.clone().into_octets_bounded(usize::from(u16::MAX)) {
                            Ok((serialised, _)) => {
                                DNS_RESPONSES_TOTAL
                                    .with_label_values(&[&response.header.rcode.to_string()])
                                    .inc();
                                DNS_RESPONSE_TIME_SECONDS
                                    .with_label_values(&["tcp"])
                                    .observe(started.elapsed().as_secs_f64());
                                let _ = reply.send(serialised).await;
                            }
                            Err(error) => {
                                tracing::warn!(?peer, ?error, "could not serialise response");
                            }
                        }
                    }
                });
            }
        }
    }

    // let queued responses for pipelined queries drain before closing
    drop(reply_tx);
    let _ = writer.await;
}

/// Delete expired cache entries every 5 minutes and refresh the cache
/// metrics.
async fn prune_cache_task(cache: SharedCache, events: EventBus) {
    let mut last = cache.stats();

    loop {
        sleep(Duration::from_secs(60 * 5)).await;

        let removed = cache.remove_expired();
        let stats = cache.stats();

        CACHE_SIZE_BYTES.set(i64::try_from(stats.size_bytes).unwrap_or(i64::MAX));
        CACHE_ENTRIES.set(i64::try_from(stats.entries).unwrap_or(i64::MAX));
        CACHE_EXPIRED_TOTAL.inc_by(stats.expirations.saturating_sub(last.expirations));
        CACHE_EVICTED_TOTAL.inc_by(stats.evictions.saturating_sub(last.evictions));

        if removed > 0 {
            tracing::info!(%removed, "cache sweep");
            events.publish(Event::Cache(CacheNotice::Flushed { count: removed }));
        }
        let evicted = stats.evictions.saturating_sub(last.evictions);
        if evicted > 0 {
            events.publish(Event::Cache(CacheNotice::Evicted {
                count: usize::try_from(evicted).unwrap_or(usize::MAX),
            }));
        }

        last = stats;
    }
}

/// Drop idle rate-limit buckets every minute.
async fn sweep_buckets_task(rate_limiter: SharedRateLimiter) {
    loop {
        sleep(Duration::from_secs(60)).await;
        let swept = rate_limiter.sweep_idle(Instant::now());
        if swept > 0 {
            tracing::debug!(%swept, "swept idle rate-limit buckets");
        }
    }
}

/// Re-read the configuration file on SIGUSR1 and swap the snapshot.
/// Queries in flight keep the snapshot they started with.
async fn reload_task(
    settings_lock: Arc<RwLock<Arc<Settings>>>,
    cache: SharedCache,
    pool: SharedUpstreamPool,
    config: Option<String>,
) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGUSR1");
            process::exit(1);
        }
    };

    loop {
        stream.recv().await;

        let Some(path) = &config else {
            tracing::info!("SIGUSR1 received but no configuration file was given");
            continue;
        };

        match Settings::new(path) {
            Ok(new_settings) => {
                cache.set_limits(&new_settings.cache);
                pool.set_upstreams(&new_settings.upstream_addrs());
                let mut lock = settings_lock.write().await;
                *lock = Arc::new(new_settings);
                tracing::info!("configuration reloaded");
            }
            Err(error) => {
                tracing::error!(?error, "could not reload configuration, keeping the old one");
            }
        }
    }
}

/// The in-process observer: counts events into Prometheus and writes
/// the structured query log.  Runs off the event bus like any other
/// subscriber, so falling behind loses events rather than slowing
/// resolution.
async fn observe_events_task(events: EventBus) {
    let mut rx = events.subscribe();

    loop {
        match rx.recv().await {
            Ok(Event::Query(record)) => {
                if record.cache_hit {
                    RESOLVER_CACHE_HIT_TOTAL.inc();
                } else if record.upstream.is_some() {
                    RESOLVER_CACHE_MISS_TOTAL.inc();
                }
                if record.error.as_deref() == Some(REFUSED_FOR_RATE_LIMIT) {
                    DNS_REQUESTS_REFUSED_TOTAL
                        .with_label_values(&[REFUSED_FOR_RATE_LIMIT])
                        .inc();
                }

                tracing::info!(
                    request_id = %record.request_id,
                    client = %record.client,
                    transport = %record.transport,
                    qname = %record.qname,
                    qtype = %record.qtype,
                    rcode = %record.rcode,
                    answers = %record.answers,
                    response_time_ms = %record.response_time_ms,
                    cache_hit = %record.cache_hit,
                    upstream = ?record.upstream,
                    error = ?record.error,
                    "query"
                );
            }
            Ok(Event::Cache(notice)) => {
                tracing::debug!(?notice, "cache event");
            }
            Ok(Event::Server(notice)) => {
                match notice {
                    ServerNotice::UpstreamFailed { upstream } => {
                        UPSTREAM_FAILED_TOTAL
                            .with_label_values(&[&upstream.to_string()])
                            .inc();
                    }
                    ServerNotice::UpstreamRecovered { upstream } => {
                        UPSTREAM_RECOVERED_TOTAL
                            .with_label_values(&[&upstream.to_string()])
                            .inc();
                    }
                    ServerNotice::Started | ServerNotice::Stopped => (),
                }
                tracing::info!(?notice, "server event");
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                EVENTS_DROPPED_TOTAL.inc_by(dropped);
                tracing::warn!(%dropped, "event observer lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn wait_for_shutdown_signal() {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGINT");
            process::exit(1);
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// A caching, forwarding DNS resolver.
///
/// relayed answers queries over UDP and TCP, serving from an
/// in-memory TTL/LRU cache when it can and otherwise forwarding to a
/// list of upstream resolvers with failover, keeping whatever comes
/// back.
///
/// Per-client rate limiting and network allow/deny lists are applied
/// before any resolution work happens.
///
/// All behaviour is driven by the configuration file; running with no
/// file serves on 127.0.0.1:5353 with no upstreams (every miss is
/// SERVFAIL).  Send SIGUSR1 to re-read the file without restarting.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}/metrics"
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_parser, env = "RELAYED_CONFIG")]
    config: Option<String>,

    /// Interface to listen on (in `ip:port` form) to serve Prometheus
    /// metrics
    #[clap(long, value_parser, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 9420)), env = "RELAYED_METRICS_INTERFACE")]
    metrics_interface: SocketAddr,
}

fn main() {
    let args = Args::parse();

    begin_logging();

    let settings = match &args.config {
        Some(path) => match Settings::new(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!(?error, "could not load configuration");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if settings.server.workers > 0 {
        builder.worker_threads(settings.server.workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(?error, "could not start the runtime");
            process::exit(1);
        }
    };

    runtime.block_on(run(args, settings));
}

async fn run(args: Args, settings: Settings) {
    let listen_addr = settings.server.listen_addr();

    tracing::info!(interface = %listen_addr, "binding DNS UDP socket");
    let udp = match UdpSocket::bind(listen_addr).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %listen_addr, "binding DNS TCP socket");
    let tcp = match TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let events = EventBus::default();
    let cache = SharedCache::new(&settings.cache);
    if let Some(path) = &settings.cache.persist_path {
        match cache.load(path) {
            Ok(restored) if restored > 0 => tracing::info!(%restored, "cache restored from disk"),
            Ok(_) => (),
            Err(error) if error.kind() == io::ErrorKind::NotFound => (),
            Err(error) => tracing::warn!(?error, "could not restore cache"),
        }
    }

    let pool = SharedUpstreamPool::new(&settings.upstream_addrs());
    let rate_limiter = SharedRateLimiter::new();
    let resolver = Resolver::new(
        cache.clone(),
        Forwarder::new(pool.clone(), events.clone()),
        rate_limiter.clone(),
        events.clone(),
    );

    let max_concurrent = settings.server.max_concurrent_requests.max(1);
    let shutdown_grace = settings.server.shutdown_grace();
    let persist_path = settings.cache.persist_path.clone();
    let settings_lock = Arc::new(RwLock::new(Arc::new(settings)));

    let listen_args = ListenArgs {
        settings_lock: settings_lock.clone(),
        resolver,
        concurrency: Arc::new(Semaphore::new(max_concurrent)),
    };

    let udp_task = tokio::spawn(listen_udp_task(listen_args.clone(), udp));
    let tcp_task = tokio::spawn(listen_tcp_task(listen_args.clone(), tcp));
    tokio::spawn(observe_events_task(events.clone()));
    tokio::spawn(prune_cache_task(cache.clone(), events.clone()));
    tokio::spawn(sweep_buckets_task(rate_limiter));
    tokio::spawn(reload_task(
        settings_lock,
        cache.clone(),
        pool,
        args.config.clone(),
    ));

    tracing::info!(interface = %args.metrics_interface, "binding metrics HTTP socket");
    let metrics_interface = args.metrics_interface;
    tokio::spawn(async move {
        if let Err(error) = serve_prometheus_endpoint_task(metrics_interface).await {
            tracing::error!(?error, "could not bind metrics HTTP socket");
            process::exit(1);
        }
    });

    events.publish(Event::Server(ServerNotice::Started));
    tracing::info!(interface = %listen_addr, "serving DNS");

    wait_for_shutdown_signal().await;

    tracing::info!("stop signal received, draining in-flight queries");
    udp_task.abort();
    tcp_task.abort();

    let grace_deadline = Instant::now() + shutdown_grace;
    while listen_args.concurrency.available_permits() < max_concurrent
        && Instant::now() < grace_deadline
    {
        sleep(Duration::from_millis(50)).await;
    }

    if let Some(path) = &persist_path {
        match cache.save(path) {
            Ok(saved) => tracing::info!(%saved, "cache saved to disk"),
            Err(error) => tracing::warn!(?error, "could not save cache"),
        }
    }

    events.publish(Event::Server(ServerNotice::Stopped));
    // a beat for observers to drain the stop notice
    sleep(Duration::from_millis(100)).await;
}
