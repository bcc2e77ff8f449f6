//! Proxy core: listener, connection pairs, request/response dispatch.
//!
//! Each accepted client gets one task owning a ConnectionPair: the client
//! socket, a lazily-dialed upstream socket, the pair's pending message IDs
//! and its filter instances. Unmodified PDUs are forwarded from their
//! original frame bytes; only messages a filter, the overlay or cache replay
//! actually changed are re-encoded.

use crate::cache::{CacheLookup, Fingerprint, ResponseCache};
use crate::config::{Config, DebugFlags, ProxyConfig};
use crate::filters::{
    FilterRegistry, RequestFilter, ResponseFilter, run_request_filters, run_response_filters,
};
use crate::framing::{FrameError, FrameReader};
use crate::ldap_protocol::{
    LdapMessage, ProtocolOp, START_TLS_OID, encode_ldap_message, parse_ldap_message,
    search_request_fingerprint,
};
use crate::overlay::YamlOverlay;
use crate::tls;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

/// Client stream: plain TCP or TLS-wrapped, selected at accept time.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Upstream stream: plain TCP or TLS per upstream_ssl.
pub enum UpstreamStream {
    Tcp(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Shared proxy state: configuration snapshot, hot-reloadable debug flags,
/// the response cache and the live-pair registry. Everything mutable is
/// behind its own lock; filter instances live in their pair.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub debug: ArcSwap<DebugFlags>,
    pub cache: Mutex<ResponseCache>,
    pub registry: FilterRegistry,
    pairs: Mutex<HashMap<u64, SocketAddr>>,
    next_pair_id: AtomicU64,
    tls_acceptor: Option<TlsAcceptor>,
    upstream_tls: Option<TlsConnector>,
    config_path: Option<PathBuf>,
}

pub struct LdapProxy {
    state: Arc<ProxyState>,
}

impl LdapProxy {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let registry = FilterRegistry::discover(&config.config)?;
        info!(
            "filters registered: {} request, {} response{}",
            registry.request_filter_count(),
            registry.response_filter_count(),
            if config.config.yaml_attributes {
                " (+ yaml overlay)"
            } else {
                ""
            }
        );
        let upstream_tls = if config.config.upstream_ssl {
            Some(TlsConnector::from(tls::upstream_client_config(
                config.config.upstream_tls_skip_verify,
            )))
        } else {
            None
        };
        let cache = ResponseCache::new(Duration::from_secs(config.config.cacheexpire));
        let state = Arc::new(ProxyState {
            debug: ArcSwap::from_pointee(config.debug),
            cache: Mutex::new(cache),
            registry,
            pairs: Mutex::new(HashMap::new()),
            next_pair_id: AtomicU64::new(1),
            tls_acceptor,
            upstream_tls,
            config_path,
            config: config.config,
        });
        Ok(Self { state })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Bind the listener and serve forever. A bind failure is the only error
    /// that escapes; everything past accept is per-connection.
    pub async fn run(&self) -> Result<()> {
        let addr = &self.state.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!(
            "listening on {}{}",
            addr,
            if self.state.config.ssl { " (TLS)" } else { "" }
        );
        self.run_on(listener).await
    }

    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        tokio::spawn(housekeeping(Arc::clone(&self.state)));

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let client = if let Some(acceptor) = state.tls_acceptor.clone() {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => ClientStream::Tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            }
                        } else {
                            ClientStream::Tcp(stream)
                        };
                        handle_client(state, client, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Background tick: re-read the configuration every 15 s and apply the debug
/// section (the only hot-reloadable part); purge the cache while no pairs
/// are active.
async fn housekeeping(state: Arc<ProxyState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(15));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Some(path) = &state.config_path {
            match Config::from_file(path) {
                Ok(new_config) => {
                    if **state.debug.load() != new_config.debug {
                        info!("debug flags reloaded from {:?}", path);
                        state.debug.store(Arc::new(new_config.debug));
                    }
                }
                Err(e) => {
                    warn!("config reload failed: {:#}; keeping last good", e);
                }
            }
        }
        if state.pairs.lock().await.is_empty() {
            state.cache.lock().await.purge();
        }
    }
}

async fn handle_client(state: Arc<ProxyState>, client: ClientStream, peer: SocketAddr) {
    let pair_id = state.next_pair_id.fetch_add(1, Ordering::Relaxed);
    state.pairs.lock().await.insert(pair_id, peer);
    let dbg = **state.debug.load();
    if dbg.net {
        debug!("pair {}: client {} connected", pair_id, peer);
    }

    let pair = ConnectionPair::new(Arc::clone(&state), pair_id, peer);
    pair.run(client).await;

    let mut pairs = state.pairs.lock().await;
    pairs.remove(&pair_id);
    let idle = pairs.is_empty();
    drop(pairs);
    if dbg.net {
        debug!("pair {}: closed", pair_id);
    }
    // Idle GC: with no pairs left, sweep expired cache entries.
    if idle {
        state.cache.lock().await.purge();
    }
}

enum Flow {
    Continue,
    Close,
}

enum Event {
    Client(Result<Vec<u8>, FrameError>),
    Upstream(Result<Vec<u8>, FrameError>),
    Idle,
}

/// One client socket paired with at most one upstream socket, plus the state
/// that ties their message streams together.
struct ConnectionPair {
    state: Arc<ProxyState>,
    id: u64,
    peer: SocketAddr,
    upstream: Option<UpstreamStream>,
    upstream_frames: FrameReader,
    /// Client message ID -> cache fingerprint the responses belong to.
    /// Only populated for cacheable (search) requests.
    pending_by_msgid: HashMap<i32, Fingerprint>,
    filters_in: Vec<Box<dyn RequestFilter>>,
    filters_out: Vec<Box<dyn ResponseFilter>>,
}

impl ConnectionPair {
    fn new(state: Arc<ProxyState>, id: u64, peer: SocketAddr) -> Self {
        let filters_in = state.registry.instantiate_request();
        let mut filters_out = state.registry.instantiate_response();
        // The overlay always runs last, after directory-activated filters.
        if state.config.yaml_attributes {
            if let Some(dir) = &state.config.yaml_dir {
                filters_out.push(Box::new(YamlOverlay::new(
                    dir.clone(),
                    state.config.overlay_prefix.clone(),
                )) as Box<dyn ResponseFilter>);
            } else {
                warn!("yaml_attributes enabled but yaml_dir unset; overlay disabled");
            }
        }
        Self {
            state,
            id,
            peer,
            upstream: None,
            upstream_frames: FrameReader::new(),
            pending_by_msgid: HashMap::new(),
            filters_in,
            filters_out,
        }
    }

    async fn run(mut self, mut client: ClientStream) {
        let mut client_frames = FrameReader::new();
        let idle_timeout = self.state.config.idletimeout;

        loop {
            let event = {
                let wait = async {
                    if let Some(up) = self.upstream.as_mut() {
                        let upstream_frames = &mut self.upstream_frames;
                        tokio::select! {
                            r = client_frames.read_frame(&mut client) => Event::Client(r),
                            r = upstream_frames.read_frame(up) => Event::Upstream(r),
                        }
                    } else {
                        Event::Client(client_frames.read_frame(&mut client).await)
                    }
                };
                if idle_timeout > 0 {
                    tokio::time::timeout(Duration::from_secs(idle_timeout), wait)
                        .await
                        .unwrap_or(Event::Idle)
                } else {
                    wait.await
                }
            };

            let flow = match event {
                Event::Client(frame) => self.on_client_frame(frame, &mut client).await,
                Event::Upstream(frame) => self.on_upstream_frame(frame, &mut client).await,
                Event::Idle => {
                    let dbg = **self.state.debug.load();
                    if dbg.net {
                        debug!("pair {}: idle for {}s, closing", self.id, idle_timeout);
                    }
                    Flow::Close
                }
            };
            if matches!(flow, Flow::Close) {
                // Both sockets are released here: the client by scope, the
                // upstream by dropping the pair.
                break;
            }
        }
    }

    async fn on_client_frame(
        &mut self,
        frame: Result<Vec<u8>, FrameError>,
        client: &mut ClientStream,
    ) -> Flow {
        let dbg = **self.state.debug.load();
        let raw = match frame {
            Ok(raw) => raw,
            Err(FrameError::Closed) => {
                if dbg.net {
                    debug!("pair {}: client {} disconnected", self.id, self.peer);
                }
                return Flow::Close;
            }
            Err(FrameError::Truncated { buffered }) => {
                if dbg.net {
                    debug!(
                        "pair {}: client {} closed mid-frame ({} bytes buffered)",
                        self.id, self.peer, buffered
                    );
                }
                return Flow::Close;
            }
            Err(e) => {
                error!("pair {}: client {}: {}", self.id, self.peer, e);
                return Flow::Close;
            }
        };

        let mut msg = match parse_ldap_message(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                error!("pair {}: undecodable request from {}: {:#}", self.id, self.peer, e);
                return Flow::Close;
            }
        };
        let is_bind = matches!(msg.protocol_op, ProtocolOp::BindRequest(_));
        dump_frame(&dbg, self.id, "client>", &raw, is_bind);

        match &msg.protocol_op {
            ProtocolOp::UnbindRequest => {
                if let Some(up) = self.upstream.as_mut() {
                    let _ = up.write_all(&raw).await;
                    let _ = up.flush().await;
                }
                if dbg.net {
                    debug!("pair {}: unbind from {}", self.id, self.peer);
                }
                return Flow::Close;
            }
            ProtocolOp::ExtendedRequest(ext) if ext.request_name == START_TLS_OID => {
                // Critical: StartTLS upgrade is not supported; nothing is
                // forwarded and the pair is torn down.
                error!(
                    "pair {}: client {} requested StartTLS; unsupported, closing pair",
                    self.id, self.peer
                );
                return Flow::Close;
            }
            _ => {}
        }

        // In-filter pipeline. A corrupted encoding under filtervalidate is
        // fatal to the pair; downstream state would be undefined.
        let mutated = match run_request_filters(
            &mut self.filters_in,
            &mut msg,
            self.state.config.filtervalidate,
            &dbg,
        ) {
            Ok(mutated) => mutated,
            Err(e) => {
                error!("pair {}: {}; closing pair", self.id, e);
                return Flow::Close;
            }
        };

        // Cache lookup for search requests. Binds never reach this path
        // structurally and are never fingerprinted.
        if self.state.config.usecache {
            if let ProtocolOp::SearchRequest(req) = &msg.protocol_op {
                let fingerprint = search_request_fingerprint(req);
                let lookup = self.state.cache.lock().await.lookup(&fingerprint);
                match lookup {
                    CacheLookup::Hit(responses) => {
                        if dbg.cache {
                            debug!(
                                "pair {}: cache hit for msgid {} ({} responses)",
                                self.id,
                                msg.message_id,
                                responses.len()
                            );
                        }
                        return self.replay_cached(client, msg.message_id, responses).await;
                    }
                    CacheLookup::InProgress => {
                        // Another pair's identical search is still streaming;
                        // forward anyway and track for completion.
                        if dbg.cache {
                            debug!(
                                "pair {}: cache entry in progress for msgid {}, forwarding",
                                self.id, msg.message_id
                            );
                        }
                        self.pending_by_msgid.insert(msg.message_id, fingerprint);
                    }
                    CacheLookup::Miss => {
                        if dbg.cache {
                            debug!("pair {}: cache miss for msgid {}", self.id, msg.message_id);
                        }
                        self.state
                            .cache
                            .lock()
                            .await
                            .begin(fingerprint.clone(), req.clone());
                        self.pending_by_msgid.insert(msg.message_id, fingerprint);
                    }
                }
            }
        }

        // Unmodified requests are forwarded from the original frame bytes.
        let bytes = if mutated {
            match encode_ldap_message(&msg) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        "pair {}: re-encode of filtered request failed: {:#}; forwarding original",
                        self.id, e
                    );
                    raw.clone()
                }
            }
        } else {
            raw
        };

        self.forward_upstream(&bytes).await
    }

    /// Lazy upstream connect and request write. Dial failure closes the
    /// pair; the client re-issues.
    async fn forward_upstream(&mut self, bytes: &[u8]) -> Flow {
        let dbg = **self.state.debug.load();
        if self.upstream.is_none() {
            match self.dial_upstream().await {
                Ok(up) => {
                    if dbg.net {
                        debug!(
                            "pair {}: connected upstream {}",
                            self.id,
                            self.state.config.upstream_addr()
                        );
                    }
                    self.upstream = Some(up);
                }
                Err(e) => {
                    error!(
                        "pair {}: upstream {} unreachable: {:#}",
                        self.id,
                        self.state.config.upstream_addr(),
                        e
                    );
                    return Flow::Close;
                }
            }
        }
        let up = self.upstream.as_mut().expect("upstream just connected");
        if let Err(e) = up.write_all(bytes).await {
            error!("pair {}: write to upstream failed: {}", self.id, e);
            return Flow::Close;
        }
        if let Err(e) = up.flush().await {
            error!("pair {}: flush to upstream failed: {}", self.id, e);
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn dial_upstream(&self) -> Result<UpstreamStream> {
        let addr = self.state.config.upstream_addr();
        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Connect to {}", addr))?;
        match &self.state.upstream_tls {
            Some(connector) => {
                let host = self.state.config.upstream_host().to_string();
                let server_name = rustls_pki_types::ServerName::try_from(host)
                    .context("Invalid upstream host for TLS")?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .context("Upstream TLS handshake")?;
                Ok(UpstreamStream::Tls(tls))
            }
            None => Ok(UpstreamStream::Tcp(tcp)),
        }
    }

    /// Replay a completed cache entry to the client with the message ID
    /// rewritten, in original storage order. Nothing is forwarded upstream
    /// and no pending mapping is recorded.
    async fn replay_cached(
        &mut self,
        client: &mut ClientStream,
        message_id: i32,
        responses: Vec<LdapMessage>,
    ) -> Flow {
        for mut response in responses {
            response.message_id = message_id;
            let bytes = match encode_ldap_message(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("pair {}: cached response failed to encode: {:#}", self.id, e);
                    return Flow::Close;
                }
            };
            if let Err(e) = client.write_all(&bytes).await {
                error!("pair {}: cached replay write failed: {}", self.id, e);
                return Flow::Close;
            }
        }
        if let Err(e) = client.flush().await {
            error!("pair {}: cached replay flush failed: {}", self.id, e);
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn on_upstream_frame(
        &mut self,
        frame: Result<Vec<u8>, FrameError>,
        client: &mut ClientStream,
    ) -> Flow {
        let dbg = **self.state.debug.load();
        let raw = match frame {
            Ok(raw) => raw,
            Err(FrameError::Closed) => {
                if dbg.net {
                    debug!("pair {}: upstream closed", self.id);
                }
                return Flow::Close;
            }
            Err(FrameError::Truncated { buffered }) => {
                if dbg.net {
                    debug!(
                        "pair {}: upstream closed mid-frame ({} bytes buffered)",
                        self.id, buffered
                    );
                }
                return Flow::Close;
            }
            Err(e) => {
                error!("pair {}: upstream: {}", self.id, e);
                return Flow::Close;
            }
        };

        let mut msg = match parse_ldap_message(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                error!("pair {}: undecodable response: {:#}", self.id, e);
                return Flow::Close;
            }
        };
        dump_frame(&dbg, self.id, "server>", &raw, false);

        // Out-filter pipeline and overlay; SearchResultEntry only.
        let mutated = match run_response_filters(
            &mut self.filters_out,
            &mut msg,
            self.state.config.filtervalidate,
            &dbg,
        ) {
            Ok(mutated) => mutated,
            Err(e) => {
                error!("pair {}: {}; closing pair", self.id, e);
                return Flow::Close;
            }
        };

        let bytes = if mutated {
            match encode_ldap_message(&msg) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        "pair {}: re-encode of filtered response failed: {:#}; forwarding original",
                        self.id, e
                    );
                    raw.clone()
                }
            }
        } else {
            raw
        };

        // Cache store: responses correlated to a pending search are appended
        // post-filter, so a replay serves exactly what this client saw.
        self.store_response(&msg, &dbg).await;

        if let Err(e) = client.write_all(&bytes).await {
            error!("pair {}: write to client {} failed: {}", self.id, self.peer, e);
            return Flow::Close;
        }
        if let Err(e) = client.flush().await {
            error!("pair {}: flush to client {} failed: {}", self.id, self.peer, e);
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn store_response(&mut self, msg: &LdapMessage, dbg: &DebugFlags) {
        if !matches!(
            msg.protocol_op,
            ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::SearchResultDone(_)
        ) {
            return;
        }
        let Some(fingerprint) = self.pending_by_msgid.get(&msg.message_id) else {
            return;
        };
        let completed = self
            .state
            .cache
            .lock()
            .await
            .append(fingerprint, msg.clone());
        if dbg.cache2 {
            debug!(
                "pair {}: cached {} for msgid {}",
                self.id,
                msg.protocol_op.name(),
                msg.message_id
            );
        }
        if completed {
            if dbg.cache {
                debug!("pair {}: search msgid {} completed in cache", self.id, msg.message_id);
            }
            self.pending_by_msgid.remove(&msg.message_id);
        }
    }
}

/// Hex-dump the first octets of a frame at debug level. Bind PDUs carry
/// credentials and are suppressed unless pktsecure is set.
fn dump_frame(dbg: &DebugFlags, pair_id: u64, direction: &str, raw: &[u8], is_bind: bool) {
    if !dbg.pkt {
        return;
    }
    if is_bind && !dbg.pktsecure {
        debug!("pair {}: {} {} bytes (bind, suppressed)", pair_id, direction, raw.len());
        return;
    }
    let shown = raw.len().min(64);
    let hex: String = raw[..shown]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    debug!("pair {}: {} {} bytes: {}", pair_id, direction, raw.len(), hex);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{
        Attribute, BindAuthentication, BindRequest, ExtendedRequest, Filter, LdapResult,
        SearchRequest, SearchResultEntry, SearchScope,
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    fn search_msg(message_id: i32, uid: &str) -> LdapMessage {
        LdapMessage {
            message_id,
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: "dc=x".to_string(),
                scope: SearchScope::SingleLevel,
                deref_aliases: 0,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: Filter::EqualityMatch {
                    attribute: "uid".to_string(),
                    value: uid.as_bytes().to_vec(),
                },
                attributes: vec![],
            }),
            controls: None,
        }
    }

    fn entry_msg(message_id: i32, dn: &str) -> LdapMessage {
        LdapMessage {
            message_id,
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: dn.to_string(),
                attributes: vec![Attribute {
                    attr_type: "cn".to_string(),
                    attr_values: vec![b"Bob".to_vec()],
                }],
            }),
            controls: None,
        }
    }

    fn done_msg(message_id: i32) -> LdapMessage {
        LdapMessage {
            message_id,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult {
                result_code: 0,
                matched_dn: String::new(),
                diagnostic_message: String::new(),
                extra: Vec::new(),
            }),
            controls: None,
        }
    }

    fn test_config(listen: &str, upstream: &str) -> Config {
        let mut config = Config {
            config: ProxyConfig::default(),
            debug: DebugFlags::default(),
        };
        config.config.listen = listen.to_string();
        config.config.upstream_ldap = upstream.to_string();
        config
    }

    /// Fake directory server: answers binds with success and searches with
    /// two entries plus a done, counting each operation.
    struct FakeUpstream {
        addr: SocketAddr,
        searches: Arc<AtomicUsize>,
        binds: Arc<AtomicUsize>,
        last_bind_name: Arc<std::sync::Mutex<String>>,
    }

    async fn spawn_fake_upstream() -> FakeUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let searches = Arc::new(AtomicUsize::new(0));
        let binds = Arc::new(AtomicUsize::new(0));
        let last_bind_name = Arc::new(std::sync::Mutex::new(String::new()));
        let s = Arc::clone(&searches);
        let b = Arc::clone(&binds);
        let n = Arc::clone(&last_bind_name);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let s = Arc::clone(&s);
                let b = Arc::clone(&b);
                let n = Arc::clone(&n);
                tokio::spawn(async move {
                    let mut frames = FrameReader::new();
                    loop {
                        let Ok(raw) = frames.read_frame(&mut sock).await else {
                            return;
                        };
                        let Ok(msg) = parse_ldap_message(&raw) else {
                            return;
                        };
                        match &msg.protocol_op {
                            ProtocolOp::BindRequest(req) => {
                                b.fetch_add(1, Ordering::SeqCst);
                                *n.lock().unwrap() = req.name.clone();
                                let resp = LdapMessage {
                                    message_id: msg.message_id,
                                    protocol_op: ProtocolOp::BindResponse(LdapResult {
                                        result_code: 0,
                                        matched_dn: String::new(),
                                        diagnostic_message: String::new(),
                                        extra: Vec::new(),
                                    }),
                                    controls: None,
                                };
                                let bytes = encode_ldap_message(&resp).unwrap();
                                sock.write_all(&bytes).await.unwrap();
                            }
                            ProtocolOp::SearchRequest(_) => {
                                s.fetch_add(1, Ordering::SeqCst);
                                for resp in [
                                    entry_msg(msg.message_id, "uid=bob,dc=x"),
                                    entry_msg(msg.message_id, "uid=bob2,dc=x"),
                                    done_msg(msg.message_id),
                                ] {
                                    let bytes = encode_ldap_message(&resp).unwrap();
                                    sock.write_all(&bytes).await.unwrap();
                                }
                            }
                            ProtocolOp::UnbindRequest => return,
                            _ => {}
                        }
                    }
                });
            }
        });
        FakeUpstream {
            addr,
            searches,
            binds,
            last_bind_name,
        }
    }

    async fn spawn_proxy(config: Config) -> (SocketAddr, Arc<ProxyState>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = LdapProxy::new(config, None, None).unwrap();
        let state = proxy.state();
        tokio::spawn(async move {
            let _ = proxy.run_on(listener).await;
        });
        (addr, state)
    }

    async fn send_msg(sock: &mut TcpStream, msg: &LdapMessage) {
        let bytes = encode_ldap_message(msg).unwrap();
        sock.write_all(&bytes).await.unwrap();
    }

    async fn read_msg(frames: &mut FrameReader, sock: &mut TcpStream) -> LdapMessage {
        let raw = frames.read_frame(sock).await.unwrap();
        parse_ldap_message(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_upstream_offline_closes_pair() {
        // Scenario: upstream unreachable; the pair is torn down promptly.
        let config = test_config("127.0.0.1:0", "127.0.0.1:1");
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        send_msg(&mut sock, &search_msg(1, "bob")).await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "socket should close without any response bytes");
    }

    #[tokio::test]
    async fn test_search_round_trip_passthrough() {
        let upstream = spawn_fake_upstream().await;
        let config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameReader::new();
        send_msg(&mut sock, &search_msg(5, "bob")).await;
        let e1 = read_msg(&mut frames, &mut sock).await;
        let e2 = read_msg(&mut frames, &mut sock).await;
        let done = read_msg(&mut frames, &mut sock).await;
        assert!(matches!(e1.protocol_op, ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(e2.protocol_op, ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(done.protocol_op, ProtocolOp::SearchResultDone(_)));
        assert_eq!(e1.message_id, 5);
        assert_eq!(done.message_id, 5);
    }

    #[tokio::test]
    async fn test_identity_passthrough_preserves_bytes() {
        // With no filters, cache or overlay, client bytes must equal
        // upstream bytes even for non-minimal BER encodings.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        // SearchResultDone with a redundant long-form outer length.
        let weird: Vec<u8> = vec![
            0x30, 0x81, 0x0C, // long-form length for a 12-byte body
            0x02, 0x01, 0x07, // messageID 7
            0x65, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let weird_clone = weird.clone();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut frames = FrameReader::new();
            let _ = frames.read_frame(&mut sock).await.unwrap();
            sock.write_all(&weird_clone).await.unwrap();
            // Hold the socket open until the client is done.
            let mut drain = [0u8; 64];
            let _ = sock.read(&mut drain).await;
        });

        let config = test_config("127.0.0.1:0", &upstream_addr.to_string());
        let (addr, _state) = spawn_proxy(config).await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        send_msg(&mut sock, &search_msg(7, "bob")).await;
        let mut frames = FrameReader::new();
        let got = frames.read_frame(&mut sock).await.unwrap();
        assert_eq!(got, weird, "proxy must not re-encode unmodified responses");
    }

    #[tokio::test]
    async fn test_cache_hit_replay() {
        // Scenario: A's search fills the cache; B's identical search replays
        // with rewritten message IDs and no second upstream request.
        let upstream = spawn_fake_upstream().await;
        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.usecache = true;
        let (addr, _state) = spawn_proxy(config).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut a_frames = FrameReader::new();
        send_msg(&mut a, &search_msg(10, "bob")).await;
        for _ in 0..3 {
            read_msg(&mut a_frames, &mut a).await;
        }
        assert_eq!(upstream.searches.load(Ordering::SeqCst), 1);

        let mut b = TcpStream::connect(addr).await.unwrap();
        let mut b_frames = FrameReader::new();
        send_msg(&mut b, &search_msg(99, "bob")).await;
        let r1 = read_msg(&mut b_frames, &mut b).await;
        let r2 = read_msg(&mut b_frames, &mut b).await;
        let r3 = read_msg(&mut b_frames, &mut b).await;
        assert_eq!(r1.message_id, 99);
        assert_eq!(r2.message_id, 99);
        assert_eq!(r3.message_id, 99);
        assert!(matches!(r1.protocol_op, ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(r3.protocol_op, ProtocolOp::SearchResultDone(_)));
        assert_eq!(
            upstream.searches.load(Ordering::SeqCst),
            1,
            "second identical search must be served from cache"
        );
    }

    #[tokio::test]
    async fn test_different_search_not_replayed() {
        let upstream = spawn_fake_upstream().await;
        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.usecache = true;
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameReader::new();
        send_msg(&mut sock, &search_msg(1, "bob")).await;
        for _ in 0..3 {
            read_msg(&mut frames, &mut sock).await;
        }
        send_msg(&mut sock, &search_msg(2, "alice")).await;
        for _ in 0..3 {
            read_msg(&mut frames, &mut sock).await;
        }
        assert_eq!(upstream.searches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bind_never_cached() {
        let upstream = spawn_fake_upstream().await;
        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.usecache = true;
        let (addr, state) = spawn_proxy(config).await;

        for msgid in [1, 2] {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            let mut frames = FrameReader::new();
            let bind = LdapMessage {
                message_id: msgid,
                protocol_op: ProtocolOp::BindRequest(BindRequest {
                    version: 3,
                    name: "cn=admin,dc=x".to_string(),
                    authentication: BindAuthentication::Simple("secret".to_string()),
                }),
                controls: None,
            };
            send_msg(&mut sock, &bind).await;
            let resp = read_msg(&mut frames, &mut sock).await;
            assert!(matches!(resp.protocol_op, ProtocolOp::BindResponse(_)));
        }
        // Both binds hit the upstream; nothing was fingerprinted.
        assert_eq!(upstream.binds.load(Ordering::SeqCst), 2);
        assert!(state.cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_dn_rewrite_filter() {
        // Scenario: the rewritebinddn in-filter turns a mail-style CN into a
        // directory DN before the upstream sees it.
        let upstream = spawn_fake_upstream().await;
        let filter_dir = tempfile::tempdir().unwrap();
        std::fs::write(filter_dir.path().join("rewritebinddn.pm"), "").unwrap();

        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.infilter_dir = Some(filter_dir.path().to_path_buf());
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameReader::new();
        let bind = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=alice@corp.example".to_string(),
                authentication: BindAuthentication::Simple("pw".to_string()),
            }),
            controls: None,
        };
        send_msg(&mut sock, &bind).await;
        let resp = read_msg(&mut frames, &mut sock).await;
        assert_eq!(resp.message_id, 2);
        assert!(matches!(resp.protocol_op, ProtocolOp::BindResponse(_)));
        assert_eq!(
            *upstream.last_bind_name.lock().unwrap(),
            "uid=alice,dc=corp,dc=example"
        );
    }

    #[tokio::test]
    async fn test_starttls_rejected() {
        // Scenario: StartTLS closes the pair without contacting upstream.
        let upstream = spawn_fake_upstream().await;
        let config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let starttls = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: START_TLS_OID.to_string(),
                request_value: None,
            }),
            controls: None,
        };
        send_msg(&mut sock, &starttls).await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "pair must close with no response");
        assert_eq!(upstream.binds.load(Ordering::SeqCst), 0);
        assert_eq!(upstream.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_yaml_overlay_injection() {
        // Scenario: overlay file keyed by DN adds prefixed attributes.
        let yaml_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            yaml_dir.path().join("uid=bob,dc=x.yaml"),
            "phone:\n  - \"555-1234\"\nrole: admin\n",
        )
        .unwrap();

        let upstream = spawn_fake_upstream().await;
        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.yaml_attributes = true;
        config.config.yaml_dir = Some(yaml_dir.path().to_path_buf());
        config.config.overlay_prefix = "my_".to_string();
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameReader::new();
        send_msg(&mut sock, &search_msg(4, "bob")).await;
        let e1 = read_msg(&mut frames, &mut sock).await;
        match &e1.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => {
                assert_eq!(entry.object_name, "uid=bob,dc=x");
                let names: Vec<&str> =
                    entry.attributes.iter().map(|a| a.attr_type.as_str()).collect();
                assert_eq!(names, vec!["cn", "my_phone", "my_role"]);
                assert_eq!(entry.attributes[1].attr_values, vec![b"555-1234".to_vec()]);
                assert_eq!(entry.attributes[2].attr_values, vec![b"admin".to_vec()]);
            }
            _ => panic!("expected entry"),
        }
        // Second entry has a different DN; no overlay file matches.
        let e2 = read_msg(&mut frames, &mut sock).await;
        match &e2.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => {
                assert_eq!(entry.attributes.len(), 1);
            }
            _ => panic!("expected entry"),
        }
    }

    #[tokio::test]
    async fn test_large_response_reassembly() {
        // Scenario: a 64 KiB entry written in small chunks arrives whole.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let big_entry = {
            let mut entry = entry_msg(8, "uid=big,dc=x");
            if let ProtocolOp::SearchResultEntry(e) = &mut entry.protocol_op {
                e.attributes.push(Attribute {
                    attr_type: "jpegPhoto".to_string(),
                    attr_values: vec![vec![0x5A; 64 * 1024]],
                });
            }
            encode_ldap_message(&entry).unwrap()
        };
        let expected = big_entry.clone();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut frames = FrameReader::new();
            let _ = frames.read_frame(&mut sock).await.unwrap();
            for chunk in big_entry.chunks(1000) {
                sock.write_all(chunk).await.unwrap();
                sock.flush().await.unwrap();
            }
            let mut drain = [0u8; 64];
            let _ = sock.read(&mut drain).await;
        });

        let config = test_config("127.0.0.1:0", &upstream_addr.to_string());
        let (addr, _state) = spawn_proxy(config).await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        send_msg(&mut sock, &search_msg(8, "big")).await;
        let mut frames = FrameReader::new();
        let got = frames.read_frame(&mut sock).await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_unbind_closes_pair() {
        let upstream = spawn_fake_upstream().await;
        let config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        let (addr, state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameReader::new();
        send_msg(&mut sock, &search_msg(1, "bob")).await;
        for _ in 0..3 {
            read_msg(&mut frames, &mut sock).await;
        }
        let unbind = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        send_msg(&mut sock, &unbind).await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        // The pair registry drains once the task finishes.
        for _ in 0..50 {
            if state.pairs.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pair was not deregistered");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_pair() {
        let upstream = spawn_fake_upstream().await;
        let mut config = test_config("127.0.0.1:0", &upstream.addr.to_string());
        config.config.idletimeout = 1;
        let (addr, _state) = spawn_proxy(config).await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .expect("idle pair should be closed")
            .unwrap();
        assert_eq!(n, 0);
    }
}
