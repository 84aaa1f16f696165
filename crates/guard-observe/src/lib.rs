use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

mod stats;

pub use stats::{StatsRegistry, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectReceived,
    RequestReceived,
    FlowBlocked,
    FlowAllowed,
    FlowRedirected,
    FlowBypassed,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    OriginConnectFailed,
    StreamClosed,
    RulesReloaded,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectReceived => "connect_received",
            Self::RequestReceived => "request_received",
            Self::FlowBlocked => "flow_blocked",
            Self::FlowAllowed => "flow_allowed",
            Self::FlowRedirected => "flow_redirected",
            Self::FlowBypassed => "flow_bypassed",
            Self::TlsHandshakeSucceeded => "tls_handshake_succeeded",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::OriginConnectFailed => "origin_connect_failed",
            Self::StreamClosed => "stream_closed",
            Self::RulesReloaded => "rules_reloaded",
        }
    }
}

/// Transport seen on the client side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransport {
    Http,
    Tls,
    Relay,
}

impl FlowTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tls => "tls",
            Self::Relay => "relay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    pub transport: FlowTransport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Consumers must not block: the proxy hot path calls `emit` inline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }

    pub fn count_of(&self, kind: EventType) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .push(event);
    }
}

/// Bounded buffer between the hot path and a slow consumer. `emit` never
/// blocks; events past the capacity are dropped and counted.
#[derive(Debug)]
pub struct BoundedEventSink {
    capacity: usize,
    queue: Mutex<Vec<Event>>,
    dropped: AtomicU64,
}

impl BoundedEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Takes everything buffered so far, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        let mut queue = self.queue.lock().expect("event queue lock poisoned");
        std::mem::take(&mut *queue)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for BoundedEventSink {
    fn emit(&self, event: Event) {
        let mut queue = self.queue.lock().expect("event queue lock poisoned");
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push(event);
    }
}

/// Emits every event to each inner sink, in order. Lets the shell stack a
/// UI feed on top of a stats consumer without the proxy knowing.
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: Event) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            sink.emit(event.clone());
        }
        last.emit(event);
    }
}

/// Derives connection counters from the event stream into its own
/// registry. For shells whose only channel is the sink; the core's own
/// registry is fed directly and must not be shared with this consumer.
pub struct StatsEventSink {
    registry: Arc<StatsRegistry>,
}

impl StatsEventSink {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(StatsRegistry::default()),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.registry.snapshot()
    }
}

impl Default for StatsEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StatsEventSink {
    fn emit(&self, event: Event) {
        match event.kind {
            EventType::ConnectReceived | EventType::RequestReceived => {
                self.registry.record_connection_open();
            }
            EventType::FlowBlocked => self.registry.record_blocked(0),
            EventType::FlowAllowed | EventType::FlowBypassed => self.registry.record_allowed(),
            EventType::StreamClosed => self.registry.record_connection_close(),
            _ => {}
        }
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BoundedEventSink, Event, EventSink, EventType, FlowContext, FlowTransport, VecEventSink,
    };

    fn sample_context(flow_id: u64) -> FlowContext {
        FlowContext {
            flow_id,
            client_addr: "127.0.0.1:51000".to_string(),
            server_host: "ads.example.com".to_string(),
            server_port: 443,
            transport: FlowTransport::Tls,
        }
    }

    #[test]
    fn vec_sink_records_events_in_order() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventType::ConnectReceived, sample_context(1)));
        sink.emit(Event::new(EventType::FlowBlocked, sample_context(1)));

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::ConnectReceived);
        assert_eq!(events[1].kind, EventType::FlowBlocked);
        assert_eq!(sink.count_of(EventType::FlowBlocked), 1);
    }

    #[test]
    fn bounded_sink_drops_past_capacity() {
        let sink = BoundedEventSink::new(2);
        for flow_id in 0..5 {
            sink.emit(Event::new(EventType::StreamClosed, sample_context(flow_id)));
        }

        assert_eq!(sink.drain().len(), 2);
        assert_eq!(sink.dropped(), 3);

        // Draining frees capacity for later events.
        sink.emit(Event::new(EventType::StreamClosed, sample_context(9)));
        assert_eq!(sink.drain().len(), 1);
    }

    #[test]
    fn event_attributes_round_trip() {
        let event = Event::new(EventType::FlowBlocked, sample_context(3))
            .with_attribute("rule", "||ads.example.com^");
        assert_eq!(
            event.attributes.get("rule").map(String::as_str),
            Some("||ads.example.com^")
        );
    }

    #[test]
    fn fanout_reaches_every_sink() {
        use std::sync::Arc;

        let first = Arc::new(VecEventSink::default());
        let second = Arc::new(VecEventSink::default());
        let fanout = super::FanoutEventSink::new(vec![
            Arc::clone(&first) as Arc<dyn EventSink>,
            Arc::clone(&second) as Arc<dyn EventSink>,
        ]);

        fanout.emit(Event::new(EventType::FlowAllowed, sample_context(1)));
        assert_eq!(first.snapshot().len(), 1);
        assert_eq!(second.snapshot().len(), 1);
    }

    #[test]
    fn stats_sink_derives_counters_from_events() {
        let sink = super::StatsEventSink::new();
        sink.emit(Event::new(EventType::RequestReceived, sample_context(1)));
        sink.emit(Event::new(EventType::FlowBlocked, sample_context(1)));
        sink.emit(Event::new(EventType::StreamClosed, sample_context(1)));
        sink.emit(Event::new(EventType::RequestReceived, sample_context(2)));
        sink.emit(Event::new(EventType::FlowAllowed, sample_context(2)));

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.blocked_total, 1);
        assert_eq!(snapshot.allowed_total, 1);
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
    }
}
