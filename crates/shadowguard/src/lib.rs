//! ShadowGuard traffic-interception core.
//!
//! Four subsystems behind one construction point: the packet inspector,
//! the domain index, the MITM proxy, and the on-device certificate
//! authority. The platform shell supplies the collaborators (key store,
//! event sink, rule sources) and feeds packets in; everything else stays
//! inside.

mod config;
mod core;
mod pipeline;

pub use config::{Config, ConfigError, LogLevel, RuleSourceConfig};
pub use core::{ConfigRuleSource, Core, CoreError, ReloadSummary, RuleSource};
pub use pipeline::{PacketPipeline, WriteBack};

pub use guard_ca::{CaError, CertificateAuthority, FileKeyStore, KeyStore, MemoryKeyStore};
pub use guard_filter::{
    CosmeticRule, FilterDecision, FilterRequest, ResourceType, RuleSet, RuleSourceText,
};
pub use guard_index::{DomainMatch, DomainRule, DomainSet, DomainSnapshot, IndexError};
pub use guard_inspect::{classify, flow_hash, inspect_hostname, Decision, HostSource, IpFamily};
pub use guard_observe::{
    BoundedEventSink, Event, EventSink, EventType, FanoutEventSink, FlowContext, FlowTransport,
    NoopEventSink, StatsEventSink, StatsRegistry, StatsSnapshot, VecEventSink,
};
pub use guard_proxy::{ProxyConfig, ProxyDelegate, ProxyError, ProxyHandle, ProxyServer};
