//! Stateless per-packet inspection. `classify` walks the earliest layer
//! that reveals a hostname, consults the domain index, and answers Drop or
//! Forward. Parse failures always answer Forward: blocking requires a
//! positive identification.

use guard_index::DomainSnapshot;

mod dns;
mod http;
mod tls;
mod wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Where in the packet the hostname was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSource {
    DnsQuery,
    TlsSni,
    HttpHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedHost {
    pub host: String,
    pub source: HostSource,
}

const PORT_DNS: u16 = 53;
const PORT_HTTPS: u16 = 443;
const PORT_HTTP: u16 = 80;

/// Pure function of the packet bytes and the index snapshot; no flow
/// state, safe from any thread.
pub fn classify(packet: &[u8], family: IpFamily, index: &DomainSnapshot) -> Decision {
    match inspect_hostname(packet, family) {
        Some(inspected) if index.lookup(&inspected.host).blocked => Decision::Drop,
        _ => Decision::Forward,
    }
}

/// Extracts the hostname a packet reveals, if any. Exposed so the shell
/// can attribute drops in its own logs.
pub fn inspect_hostname(packet: &[u8], family: IpFamily) -> Option<InspectedHost> {
    let transport = match family {
        IpFamily::V4 => wire::slice_ipv4(packet)?,
        IpFamily::V6 => wire::slice_ipv6(packet)?,
    };

    match (transport.protocol, transport.dst_port) {
        (wire::PROTOCOL_UDP, PORT_DNS) => {
            dns::query_name(transport.payload).map(|host| InspectedHost {
                host,
                source: HostSource::DnsQuery,
            })
        }
        (wire::PROTOCOL_TCP, PORT_HTTPS) => {
            tls::client_hello_sni(transport.payload).map(|host| InspectedHost {
                host,
                source: HostSource::TlsSni,
            })
        }
        (wire::PROTOCOL_TCP, PORT_HTTP) => {
            http::host_header(transport.payload).map(|host| InspectedHost {
                host,
                source: HostSource::HttpHost,
            })
        }
        _ => None,
    }
}

/// Stable hash of the (src ip, src port, dst ip, dst port) tuple, used to
/// pin every packet of one flow to one pipeline worker. Packets whose
/// headers cannot be sliced hash over their raw bytes instead, which is
/// still deterministic per packet.
pub fn flow_hash(packet: &[u8], family: IpFamily) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    let mut feed = |bytes: &[u8]| {
        for &byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    };

    match family {
        IpFamily::V4 if packet.len() >= 20 && packet[0] >> 4 == 4 => {
            feed(&packet[12..20]);
            if let Some(transport) = wire::slice_ipv4(packet) {
                let header_len = usize::from(packet[0] & 0x0f) * 4;
                // Source and destination ports head the TCP/UDP header.
                if packet.len() >= header_len + 4 {
                    feed(&packet[header_len..header_len + 4]);
                }
                feed(&[transport.protocol]);
            }
        }
        IpFamily::V6 if packet.len() >= 40 && packet[0] >> 4 == 6 => {
            feed(&packet[8..40]);
            if packet.len() >= 44 {
                feed(&packet[40..44]);
            }
        }
        _ => feed(packet),
    }
    hash
}

/// Packet construction helpers shared by this crate's tests and the
/// end-to-end scenarios downstream.
pub mod testutil {
    /// DNS query payload: one question, A/IN.
    pub fn dns_query_payload(name: &str, flags: u16) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1234_u16.to_be_bytes());
        payload.extend_from_slice(&flags.to_be_bytes());
        payload.extend_from_slice(&1_u16.to_be_bytes());
        payload.extend_from_slice(&[0; 6]);
        for label in name.split('.') {
            payload.push(label.len() as u8);
            payload.extend_from_slice(label.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&1_u16.to_be_bytes());
        payload.extend_from_slice(&1_u16.to_be_bytes());
        payload
    }

    /// TLS 1.2-style ClientHello record, optionally carrying an SNI entry.
    pub fn client_hello_record(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = sni {
            let mut entry = Vec::new();
            entry.push(0x00);
            entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
            entry.extend_from_slice(host.as_bytes());

            let mut sni_body = Vec::new();
            sni_body.extend_from_slice(&(entry.len() as u16).to_be_bytes());
            sni_body.extend_from_slice(&entry);

            extensions.extend_from_slice(&0x0000_u16.to_be_bytes());
            extensions.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni_body);
        }
        extensions.extend_from_slice(&0x0015_u16.to_be_bytes());
        extensions.extend_from_slice(&4_u16.to_be_bytes());
        extensions.extend_from_slice(&[0; 4]);

        let mut hello = Vec::new();
        hello.extend_from_slice(&0x0303_u16.to_be_bytes());
        hello.extend_from_slice(&[0xab; 32]);
        hello.push(0);
        hello.extend_from_slice(&2_u16.to_be_bytes());
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1);
        hello.push(0);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01);
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// Minimal IPv4 datagram around a UDP payload.
    pub fn ipv4_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0_u8; 20];
        packet[0] = 0x45;
        packet[8] = 64;
        packet[9] = 17;
        let total = 20 + 8 + payload.len();
        packet[2] = (total >> 8) as u8;
        packet[3] = total as u8;

        let mut udp = vec![0_u8; 8];
        udp[0] = 0xc0;
        udp[1] = 0x00;
        udp[2] = (dst_port >> 8) as u8;
        udp[3] = dst_port as u8;
        let udp_len = 8 + payload.len();
        udp[4] = (udp_len >> 8) as u8;
        udp[5] = udp_len as u8;

        packet.extend_from_slice(&udp);
        packet.extend_from_slice(payload);
        packet
    }

    /// Minimal IPv4 datagram around a TCP payload (20-byte TCP header).
    pub fn ipv4_tcp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0_u8; 20];
        packet[0] = 0x45;
        packet[8] = 64;
        packet[9] = 6;
        let total = 20 + 20 + payload.len();
        packet[2] = (total >> 8) as u8;
        packet[3] = total as u8;

        let mut tcp = vec![0_u8; 20];
        tcp[0] = 0xc0;
        tcp[1] = 0x01;
        tcp[2] = (dst_port >> 8) as u8;
        tcp[3] = dst_port as u8;
        tcp[12] = 5 << 4;
        tcp[13] = 0x18; // PSH|ACK

        packet.extend_from_slice(&tcp);
        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use guard_index::{DomainRule, DomainSet};

    use super::testutil::{client_hello_record, dns_query_payload, ipv4_tcp, ipv4_udp};
    use super::{classify, inspect_hostname, Decision, HostSource, IpFamily};

    fn index(domains: &[&str]) -> std::sync::Arc<guard_index::DomainSnapshot> {
        DomainSet::build(domains.iter().map(|domain| DomainRule::new(*domain)))
            .expect("build index")
    }

    #[test]
    fn dns_query_for_blocked_domain_is_dropped() {
        let snapshot = index(&["doubleclick.net"]);
        let packet = ipv4_udp(53, &dns_query_payload("doubleclick.net", 0x0100));
        assert_eq!(
            classify(&packet, IpFamily::V4, &snapshot),
            Decision::Drop
        );
    }

    #[test]
    fn dns_query_for_other_domain_is_forwarded() {
        let snapshot = index(&["doubleclick.net"]);
        let packet = ipv4_udp(53, &dns_query_payload("wikipedia.org", 0x0100));
        assert_eq!(
            classify(&packet, IpFamily::V4, &snapshot),
            Decision::Forward
        );
    }

    #[test]
    fn sni_matches_wildcard_rules() {
        let snapshot = index(&["*.google.com"]);
        let packet = ipv4_tcp(443, &client_hello_record(Some("ads.google.com")));
        assert_eq!(classify(&packet, IpFamily::V4, &snapshot), Decision::Drop);

        let miss = index(&["ads.google.net"]);
        assert_eq!(classify(&packet, IpFamily::V4, &miss), Decision::Forward);
    }

    #[test]
    fn http_host_header_is_inspected() {
        let snapshot = index(&["tracker.example.com"]);
        let payload = b"GET /p.gif HTTP/1.1\r\nHost: tracker.example.com\r\n\r\n";
        let packet = ipv4_tcp(80, payload);
        assert_eq!(classify(&packet, IpFamily::V4, &snapshot), Decision::Drop);

        let inspected = inspect_hostname(&packet, IpFamily::V4).expect("host");
        assert_eq!(inspected.source, HostSource::HttpHost);
    }

    #[test]
    fn bare_tcp_and_unknown_ports_forward() {
        let snapshot = index(&["doubleclick.net"]);
        let syn = ipv4_tcp(443, &[]);
        assert_eq!(classify(&syn, IpFamily::V4, &snapshot), Decision::Forward);

        let odd_port = ipv4_tcp(8443, &client_hello_record(Some("doubleclick.net")));
        assert_eq!(
            classify(&odd_port, IpFamily::V4, &snapshot),
            Decision::Forward
        );
    }

    #[test]
    fn truncated_packets_forward() {
        let snapshot = index(&["doubleclick.net"]);
        let packet = ipv4_udp(53, &dns_query_payload("doubleclick.net", 0x0100));
        for cut in 0..packet.len() {
            assert_eq!(
                classify(&packet[..cut], IpFamily::V4, &snapshot),
                Decision::Forward,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn ipv6_without_extensions_is_inspected() {
        let snapshot = index(&["doubleclick.net"]);
        let payload = dns_query_payload("doubleclick.net", 0x0100);

        let mut packet = vec![0_u8; 40];
        packet[0] = 0x60;
        packet[6] = 17; // next header: UDP
        let mut udp = vec![0_u8; 8];
        udp[2] = 0;
        udp[3] = 53;
        packet.extend_from_slice(&udp);
        packet.extend_from_slice(&payload);

        assert_eq!(classify(&packet, IpFamily::V6, &snapshot), Decision::Drop);

        // Hop-by-hop extension header: conservative Forward.
        let mut with_extension = packet.clone();
        with_extension[6] = 0;
        assert_eq!(
            classify(&with_extension, IpFamily::V6, &snapshot),
            Decision::Forward
        );
    }
}
