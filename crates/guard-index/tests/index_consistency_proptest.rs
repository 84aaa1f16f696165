use guard_index::{DomainRule, DomainSet};
use proptest::prelude::*;

fn label_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}"
}

fn domain_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(label_strategy(), 2..5).prop_map(|labels| labels.join("."))
}

proptest! {
    /// Every domain fed to build() must be found blocked by lookup().
    #[test]
    fn built_domains_are_blocked(domains in prop::collection::vec(domain_strategy(), 1..40)) {
        let snapshot = DomainSet::build(domains.iter().cloned().map(DomainRule::new))
            .expect("generated domains are valid");
        for domain in &domains {
            prop_assert!(snapshot.lookup(domain).blocked, "missing {}", domain);
        }
    }

    /// A domain outside every rule's cone must not be blocked. Queries are
    /// kept disjoint from rules by construction (distinct trailing label).
    #[test]
    fn unrelated_domains_are_not_blocked(
        domains in prop::collection::vec(domain_strategy(), 1..40),
        probe in domain_strategy(),
    ) {
        let rules: Vec<DomainRule> = domains
            .iter()
            .map(|domain| DomainRule::new(format!("{domain}.blocked")))
            .collect();
        let snapshot = DomainSet::build(rules).expect("valid rules");

        let query = format!("{probe}.probe");
        prop_assert!(!snapshot.lookup(&query).blocked);
    }

    /// Wildcard rules cover strict subdomains and never the base itself.
    #[test]
    fn wildcard_cone(base in domain_strategy(), sub in label_strategy()) {
        let snapshot = DomainSet::build([DomainRule::new(format!("*.{base}"))])
            .expect("valid wildcard");
        let query = format!("{}.{}", sub, base);
        prop_assert!(snapshot.lookup(&query).blocked);
        prop_assert!(!snapshot.lookup(&base).blocked);
    }

    /// lookup() is total: arbitrary query bytes never panic.
    #[test]
    fn lookup_never_panics(query in "\\PC{0,300}") {
        let snapshot = DomainSet::build([DomainRule::new("example.com")]).expect("build");
        let _ = snapshot.lookup(&query);
    }
}
