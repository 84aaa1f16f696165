use guard_index::{DomainRule, DomainSet};
use guard_inspect::{classify, testutil, Decision, IpFamily};
use proptest::prelude::*;

const MTU: usize = 1500;

proptest! {
    /// For any byte soup up to MTU, classify terminates and never panics.
    #[test]
    fn classify_is_total_on_arbitrary_bytes(
        bytes in prop::collection::vec(any::<u8>(), 0..MTU),
        family_v6 in any::<bool>(),
    ) {
        let snapshot = DomainSet::build([
            DomainRule::new("doubleclick.net"),
            DomainRule::new("*.tracker.example"),
        ])
        .expect("build");

        let family = if family_v6 { IpFamily::V6 } else { IpFamily::V4 };
        let _ = classify(&bytes, family, &snapshot);
    }

    /// Mutating any single byte of a well-formed blocked packet must never
    /// panic, and may only flip the decision, not corrupt it.
    #[test]
    fn single_byte_mutations_are_safe(position in 0_usize..100, value in any::<u8>()) {
        let snapshot = DomainSet::build([DomainRule::new("doubleclick.net")])
            .expect("build");
        let mut packet = testutil::ipv4_udp(
            53,
            &testutil::dns_query_payload("doubleclick.net", 0x0100),
        );
        let index = position % packet.len();
        packet[index] = value;
        let decision = classify(&packet, IpFamily::V4, &snapshot);
        prop_assert!(matches!(decision, Decision::Drop | Decision::Forward));
    }
}

#[test]
fn packet_bytes_are_never_written() {
    let snapshot = DomainSet::build([DomainRule::new("doubleclick.net")]).expect("build");
    let packet = testutil::ipv4_udp(53, &testutil::dns_query_payload("doubleclick.net", 0x0100));
    let before = packet.clone();
    let _ = classify(&packet, IpFamily::V4, &snapshot);
    assert_eq!(packet, before);
}
