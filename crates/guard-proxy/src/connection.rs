//! Per-connection state machine. Every path funnels into Closing: the
//! socket halves are owned by this task and dropped on every exit.

use std::io;
use std::sync::Arc;

use guard_filter::{FilterDecision, FilterRequest, ResourceType, RuleSet};
use guard_observe::{Event, EventType, FlowContext, FlowTransport};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::http::{
    blocked_response, error_response, parse_request_head, read_request_head, redirect_response,
    RequestHead, RequestParseError, CONNECTION_ESTABLISHED,
};
use crate::relay::{copy_bidirectional, PrefixedStream};
use crate::runtime::ProxyRuntime;
use crate::tls::{
    accept_client_tls, connect_origin_tls, origin_client_config, server_config_for_leaf,
};

/// Rough per-request transfer a block saved; feeds `bytes_saved_estimate`.
const BLOCKED_TRANSFER_ESTIMATE: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    ReadingRequest,
    ConnectingOrigin,
    TlsHandshakingClient,
    TlsHandshakingOrigin,
    Streaming,
    Closing,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadingRequest => "reading_request",
            Self::ConnectingOrigin => "connecting_origin",
            Self::TlsHandshakingClient => "tls_handshaking_client",
            Self::TlsHandshakingOrigin => "tls_handshaking_origin",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
        }
    }
}

struct ConnectionState {
    flow_id: u64,
    client_addr: String,
    phase: ConnectionPhase,
}

impl ConnectionState {
    fn context(&self, head: &RequestHead, transport: FlowTransport) -> FlowContext {
        FlowContext {
            flow_id: self.flow_id,
            client_addr: self.client_addr.clone(),
            server_host: head.host.clone(),
            server_port: head.port,
            transport,
        }
    }

    fn enter(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
    }
}

pub(crate) async fn handle_connection(
    runtime: Arc<ProxyRuntime>,
    rules: Arc<RuleSet>,
    mut client: TcpStream,
    client_addr: String,
) -> io::Result<()> {
    let mut state = ConnectionState {
        flow_id: runtime.allocate_flow_id(),
        client_addr,
        phase: ConnectionPhase::ReadingRequest,
    };

    let head = match read_and_parse_head(&runtime, &mut client).await? {
        Some(head) => head,
        None => return Ok(()),
    };

    runtime.emit(Event::new(
        EventType::RequestReceived,
        state.context(&head, FlowTransport::Http),
    ));

    if head.is_connect() {
        if runtime.bypass.matches(&head.host) {
            return relay_bypass(runtime, state, client, head).await;
        }
        handle_connect(runtime, rules, state, client, head).await
    } else {
        handle_plain_http(runtime, rules, state, client, head).await
    }
}

async fn read_and_parse_head(
    runtime: &ProxyRuntime,
    client: &mut TcpStream,
) -> io::Result<Option<RequestHead>> {
    let (buffer, head_end) =
        match read_request_head(client, runtime.config.max_request_head_bytes).await {
            Ok(read) => read,
            Err(RequestParseError::IncompleteHead) => return Ok(None),
            Err(error) => {
                (runtime.delegate.on_error)(None, &error.to_string());
                client
                    .write_all(&error_response("400 Bad Request", "malformed request"))
                    .await?;
                return Ok(None);
            }
        };

    match parse_request_head(&buffer, head_end) {
        Ok(head) => Ok(Some(head)),
        Err(error) => {
            (runtime.delegate.on_error)(None, &error.to_string());
            client
                .write_all(&error_response("400 Bad Request", "malformed request"))
                .await?;
            Ok(None)
        }
    }
}

fn decide(rules: &RuleSet, head: &RequestHead) -> FilterDecision {
    rules.decide(&FilterRequest {
        url: &head.url,
        domain: &head.host,
        resource_type: ResourceType::Document,
        initiator: None,
    })
}

/// CONNECT with MITM. Blocks are answered with the plain-text 403 *before*
/// any `200 Connection Established`.
async fn handle_connect(
    runtime: Arc<ProxyRuntime>,
    rules: Arc<RuleSet>,
    mut state: ConnectionState,
    mut client: TcpStream,
    head: RequestHead,
) -> io::Result<()> {
    match decide(&rules, &head) {
        FilterDecision::Block { rule } | FilterDecision::Redirect { rule, .. } => {
            return write_block(&runtime, &mut state, &mut client, &head, &rule).await;
        }
        FilterDecision::Allow { .. } | FilterDecision::Pass => {}
    }

    // Leaf minting may generate a key pair; keep it off the async workers.
    let authority = Arc::clone(&runtime.ca);
    let leaf_host = head.host.clone();
    let minted = tokio::task::spawn_blocking(move || authority.mint_leaf(&leaf_host)).await;
    let leaf = match minted {
        Ok(Ok(leaf)) => leaf,
        Ok(Err(error)) => {
            (runtime.delegate.on_error)(Some(&head.url), &error.to_string());
            client
                .write_all(&error_response("502 Bad Gateway", "certificate unavailable"))
                .await?;
            return close(&runtime, &mut state, &head, "leaf_mint_failed", None);
        }
        Err(join_error) => {
            (runtime.delegate.on_error)(Some(&head.url), &join_error.to_string());
            client
                .write_all(&error_response("502 Bad Gateway", "certificate unavailable"))
                .await?;
            return close(&runtime, &mut state, &head, "leaf_mint_failed", None);
        }
    };
    runtime.publish_leaf_cache_stats();

    client.write_all(CONNECTION_ESTABLISHED).await?;

    state.enter(ConnectionPhase::TlsHandshakingClient);
    let server_config = match server_config_for_leaf(&leaf, runtime.config.http2_enabled) {
        Ok(config) => config,
        Err(error) => {
            (runtime.delegate.on_tls_handshake)(&head.host, false);
            (runtime.delegate.on_error)(Some(&head.url), &error.to_string());
            return close(&runtime, &mut state, &head, "tls_config_failed", None);
        }
    };
    let client_stream = PrefixedStream::new(head.leftover.clone(), client);
    let handshake = tokio::time::timeout(
        runtime.config.tls_handshake_timeout,
        accept_client_tls(server_config, client_stream),
    )
    .await;
    let mut client_tls = match handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            (runtime.delegate.on_tls_handshake)(&head.host, false);
            runtime.emit(Event::new(
                EventType::TlsHandshakeFailed,
                state.context(&head, FlowTransport::Tls),
            ));
            return close(&runtime, &mut state, &head, "client_tls_failed", Some(&error.to_string()));
        }
        Err(_) => {
            (runtime.delegate.on_tls_handshake)(&head.host, false);
            runtime.emit(Event::new(
                EventType::TlsHandshakeFailed,
                state.context(&head, FlowTransport::Tls),
            ));
            return close(&runtime, &mut state, &head, "client_tls_timeout", None);
        }
    };
    (runtime.delegate.on_tls_handshake)(&head.host, true);
    runtime.emit(Event::new(
        EventType::TlsHandshakeSucceeded,
        state.context(&head, FlowTransport::Tls),
    ));
    let negotiated_alpn = client_tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(<[u8]>::to_vec);

    state.enter(ConnectionPhase::ConnectingOrigin);
    let origin_tcp = match connect_origin(&runtime, &head).await {
        Ok(stream) => stream,
        Err(detail) => {
            (runtime.delegate.on_error)(Some(&head.url), &detail);
            runtime.emit(Event::new(
                EventType::OriginConnectFailed,
                state.context(&head, FlowTransport::Tls),
            ));
            let _ = client_tls.shutdown().await;
            return close(&runtime, &mut state, &head, "origin_connect_failed", Some(&detail));
        }
    };

    state.enter(ConnectionPhase::TlsHandshakingOrigin);
    let origin_config = match origin_client_config(
        runtime.config.origin_verify_system_trust,
        &runtime.config.extra_origin_roots_der,
        negotiated_alpn,
    ) {
        Ok(config) => config,
        Err(error) => {
            (runtime.delegate.on_error)(Some(&head.url), &error.to_string());
            let _ = client_tls.shutdown().await;
            return close(&runtime, &mut state, &head, "origin_tls_config_failed", None);
        }
    };
    let origin_handshake = tokio::time::timeout(
        runtime.config.tls_handshake_timeout,
        connect_origin_tls(origin_config, &head.host, origin_tcp),
    )
    .await;
    let mut origin_tls = match origin_handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            (runtime.delegate.on_error)(Some(&head.url), &error.to_string());
            let _ = client_tls.shutdown().await;
            return close(&runtime, &mut state, &head, "origin_tls_failed", Some(&error.to_string()));
        }
        Err(_) => {
            (runtime.delegate.on_error)(Some(&head.url), "origin TLS handshake timed out");
            let _ = client_tls.shutdown().await;
            return close(&runtime, &mut state, &head, "origin_tls_timeout", None);
        }
    };

    runtime.stats.record_allowed();
    (runtime.delegate.on_allowed)(&head.url);
    runtime.emit(Event::new(
        EventType::FlowAllowed,
        state.context(&head, FlowTransport::Tls),
    ));

    state.enter(ConnectionPhase::Streaming);
    let outcome = copy_bidirectional(
        &mut client_tls,
        &mut origin_tls,
        runtime.config.idle_timeout,
    )
    .await;
    finish_streaming(&runtime, &mut state, &head, FlowTransport::Tls, outcome)
}

/// Bypass: opaque relay after `200 Connection Established`, no TLS
/// termination and no handshake delegate calls.
async fn relay_bypass(
    runtime: Arc<ProxyRuntime>,
    mut state: ConnectionState,
    mut client: TcpStream,
    head: RequestHead,
) -> io::Result<()> {
    state.enter(ConnectionPhase::ConnectingOrigin);
    let mut origin = match connect_origin(&runtime, &head).await {
        Ok(stream) => stream,
        Err(detail) => {
            (runtime.delegate.on_error)(Some(&head.url), &detail);
            runtime.emit(Event::new(
                EventType::OriginConnectFailed,
                state.context(&head, FlowTransport::Relay),
            ));
            client
                .write_all(&error_response("502 Bad Gateway", "origin unreachable"))
                .await?;
            return close(&runtime, &mut state, &head, "origin_connect_failed", Some(&detail));
        }
    };

    client.write_all(CONNECTION_ESTABLISHED).await?;
    if !head.leftover.is_empty() {
        origin.write_all(&head.leftover).await?;
    }

    runtime.emit(Event::new(
        EventType::FlowBypassed,
        state.context(&head, FlowTransport::Relay),
    ));

    state.enter(ConnectionPhase::Streaming);
    let outcome =
        copy_bidirectional(&mut client, &mut origin, runtime.config.idle_timeout).await;
    finish_streaming(&runtime, &mut state, &head, FlowTransport::Relay, outcome)
}

/// Plain-HTTP requests: decide, then block, redirect, or forward the
/// buffered request and stream.
async fn handle_plain_http(
    runtime: Arc<ProxyRuntime>,
    rules: Arc<RuleSet>,
    mut state: ConnectionState,
    mut client: TcpStream,
    head: RequestHead,
) -> io::Result<()> {
    match decide(&rules, &head) {
        FilterDecision::Block { rule } => {
            return write_block(&runtime, &mut state, &mut client, &head, &rule).await;
        }
        FilterDecision::Redirect { target, rule } => {
            runtime.emit(
                Event::new(
                    EventType::FlowRedirected,
                    state.context(&head, FlowTransport::Http),
                )
                .with_attribute("rule", rule.as_ref())
                .with_attribute("target", target.clone()),
            );
            client.write_all(&redirect_response(&target)).await?;
            return close(&runtime, &mut state, &head, "redirected", None);
        }
        FilterDecision::Allow { .. } | FilterDecision::Pass => {}
    }

    state.enter(ConnectionPhase::ConnectingOrigin);
    let mut origin = match connect_origin(&runtime, &head).await {
        Ok(stream) => stream,
        Err(detail) => {
            (runtime.delegate.on_error)(Some(&head.url), &detail);
            runtime.emit(Event::new(
                EventType::OriginConnectFailed,
                state.context(&head, FlowTransport::Http),
            ));
            client
                .write_all(&error_response("502 Bad Gateway", "origin unreachable"))
                .await?;
            return close(&runtime, &mut state, &head, "origin_connect_failed", Some(&detail));
        }
    };

    origin.write_all(&head.raw_head).await?;
    if !head.leftover.is_empty() {
        origin.write_all(&head.leftover).await?;
    }

    runtime.stats.record_allowed();
    (runtime.delegate.on_allowed)(&head.url);
    runtime.emit(Event::new(
        EventType::FlowAllowed,
        state.context(&head, FlowTransport::Http),
    ));

    state.enter(ConnectionPhase::Streaming);
    let outcome =
        copy_bidirectional(&mut client, &mut origin, runtime.config.idle_timeout).await;
    finish_streaming(&runtime, &mut state, &head, FlowTransport::Http, outcome)
}

async fn connect_origin(runtime: &ProxyRuntime, head: &RequestHead) -> Result<TcpStream, String> {
    match tokio::time::timeout(
        runtime.config.origin_connect_timeout,
        TcpStream::connect((head.host.as_str(), head.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(format!("origin connect failed: {error}")),
        Err(_) => Err("origin connect timed out".to_string()),
    }
}

async fn write_block(
    runtime: &ProxyRuntime,
    state: &mut ConnectionState,
    client: &mut TcpStream,
    head: &RequestHead,
    rule: &str,
) -> io::Result<()> {
    runtime.stats.record_blocked(BLOCKED_TRANSFER_ESTIMATE);
    (runtime.delegate.on_blocked)(&head.url, rule);
    runtime.emit(
        Event::new(
            EventType::FlowBlocked,
            state.context(head, FlowTransport::Http),
        )
        .with_attribute("rule", rule),
    );
    client.write_all(&blocked_response()).await?;
    close(runtime, state, head, "blocked", Some(rule))
}

fn finish_streaming(
    runtime: &ProxyRuntime,
    state: &mut ConnectionState,
    head: &RequestHead,
    transport: FlowTransport,
    outcome: io::Result<(u64, u64)>,
) -> io::Result<()> {
    state.enter(ConnectionPhase::Closing);
    let mut event = Event::new(EventType::StreamClosed, state.context(head, transport));
    match outcome {
        Ok((from_client, from_origin)) => {
            event = event
                .with_attribute("reason", "relay_eof")
                .with_attribute("bytes_from_client", from_client.to_string())
                .with_attribute("bytes_from_origin", from_origin.to_string());
            runtime.emit(event);
            Ok(())
        }
        Err(error) => {
            event = event
                .with_attribute("reason", "relay_error")
                .with_attribute("detail", error.to_string());
            runtime.emit(event);
            (runtime.delegate.on_error)(Some(&head.url), &error.to_string());
            Ok(())
        }
    }
}

fn close(
    runtime: &ProxyRuntime,
    state: &mut ConnectionState,
    head: &RequestHead,
    reason: &str,
    detail: Option<&str>,
) -> io::Result<()> {
    let last_phase = state.phase;
    state.enter(ConnectionPhase::Closing);
    let mut event = Event::new(
        EventType::StreamClosed,
        state.context(head, FlowTransport::Http),
    )
    .with_attribute("reason", reason)
    .with_attribute("last_phase", last_phase.as_str());
    if let Some(detail) = detail {
        event = event.with_attribute("detail", detail);
    }
    runtime.emit(event);
    Ok(())
}
