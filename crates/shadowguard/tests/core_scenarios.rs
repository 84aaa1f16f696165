//! The literal end-to-end packet scenarios, driven through `Core`.

use std::sync::Arc;

use guard_inspect::testutil::{client_hello_record, dns_query_payload, ipv4_tcp, ipv4_udp};
use shadowguard::{
    Config, ConfigRuleSource, Core, Decision, IpFamily, MemoryKeyStore, NoopEventSink,
    ProxyDelegate, RuleSourceConfig,
};

fn core_with_rules(rule_text: &str) -> Core {
    let config = Config {
        rule_sources: vec![RuleSourceConfig {
            id: "builtin".to_string(),
            enabled: true,
            text_blob: rule_text.to_string(),
        }],
        ..Config::default()
    };
    Core::new(
        config,
        Arc::new(MemoryKeyStore::default()),
        Arc::new(NoopEventSink),
        ProxyDelegate::default(),
        Box::new(ConfigRuleSource::new(vec![RuleSourceConfig {
            id: "builtin".to_string(),
            enabled: true,
            text_blob: rule_text.to_string(),
        }])),
    )
    .expect("core")
}

#[test]
fn dns_query_for_blocked_domain_is_dropped() {
    let core = core_with_rules("||doubleclick.net^\n");
    let packet = ipv4_udp(53, &dns_query_payload("doubleclick.net", 0x0100));
    assert_eq!(core.classify_packet(&packet, IpFamily::V4), Decision::Drop);

    let stats = core.stats_snapshot();
    assert_eq!(stats.blocked_total, 1);
    assert!(stats.trie_hits >= 1);
}

#[test]
fn dns_query_for_unlisted_domain_is_forwarded() {
    let core = core_with_rules("||doubleclick.net^\n");
    let packet = ipv4_udp(53, &dns_query_payload("wikipedia.org", 0x0100));
    assert_eq!(
        core.classify_packet(&packet, IpFamily::V4),
        Decision::Forward
    );
}

#[test]
fn tls_sni_matches_wildcard_rule() {
    let core = core_with_rules("||*.google.com^\n");
    let hello = ipv4_tcp(443, &client_hello_record(Some("ads.google.com")));
    assert_eq!(core.classify_packet(&hello, IpFamily::V4), Decision::Drop);

    let near_miss = core_with_rules("||ads.google.net^\n");
    assert_eq!(
        near_miss.classify_packet(&hello, IpFamily::V4),
        Decision::Forward
    );
}

#[test]
fn reload_swaps_the_snapshot_for_new_classifications() {
    let core = core_with_rules("");
    let packet = ipv4_udp(53, &dns_query_payload("doubleclick.net", 0x0100));
    assert_eq!(
        core.classify_packet(&packet, IpFamily::V4),
        Decision::Forward
    );

    // The rule source is fixed at construction here, so a reload keeps the
    // same (empty) rules but must still bump the generation.
    let summary = core.reload_rules().expect("reload");
    assert_eq!(summary.generation, 2);
    assert_eq!(summary.domains_indexed, 0);
}

#[test]
fn hosts_file_rules_block_dns() {
    let core = core_with_rules("0.0.0.0 metrics.example.net\n! comment\n");
    let packet = ipv4_udp(53, &dns_query_payload("metrics.example.net", 0x0100));
    assert_eq!(core.classify_packet(&packet, IpFamily::V4), Decision::Drop);
}

#[test]
fn root_pem_exports_and_regenerates() {
    let core = core_with_rules("");
    let first = core.export_root_pem().expect("export");
    assert!(first.starts_with("-----BEGIN CERTIFICATE-----"));

    core.regenerate_root().expect("regenerate");
    let second = core.export_root_pem().expect("export after regenerate");
    assert_ne!(first, second);
}

#[test]
fn invalid_config_is_rejected_before_any_side_effect() {
    let config = Config {
        proxy_port: 0,
        ..Config::default()
    };
    let result = Core::new(
        config,
        Arc::new(MemoryKeyStore::default()),
        Arc::new(NoopEventSink),
        ProxyDelegate::default(),
        Box::new(ConfigRuleSource::new(Vec::new())),
    );
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_lifecycle_through_core() {
    // Reserve an ephemeral port for the core config.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);

    let config = Config {
        proxy_port: port,
        ..Config::default()
    };
    let mut core = Core::new(
        config,
        Arc::new(MemoryKeyStore::default()),
        Arc::new(NoopEventSink),
        ProxyDelegate::default(),
        Box::new(ConfigRuleSource::new(vec![RuleSourceConfig {
            id: "builtin".to_string(),
            enabled: true,
            text_blob: "||tracker.example.com^\n".to_string(),
        }])),
    )
    .expect("core");

    let local_addr = core.start_proxy().await.expect("start");
    assert!(core.proxy_running());
    assert!(core.start_proxy().await.is_err());

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut client = tokio::net::TcpStream::connect(local_addr)
        .await
        .expect("connect");
    client
        .write_all(b"GET http://tracker.example.com/ HTTP/1.1\r\nHost: tracker.example.com\r\n\r\n")
        .await
        .expect("send");
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read");
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 403 Forbidden"));

    core.stop_proxy().await;
    assert!(!core.proxy_running());
}
