//! Bypass patterns: hosts relayed opaquely, with no TLS termination.
//! Supports exact domains and `*.suffix`.

use guard_index::normalize_domain;

use crate::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BypassPattern {
    Exact(String),
    /// Matches the base domain and every subdomain of it.
    Suffix(String),
}

#[derive(Debug, Clone, Default)]
pub struct BypassList {
    patterns: Vec<BypassPattern>,
}

impl BypassList {
    /// Invalid patterns are configuration errors at load, not silent
    /// no-matches at runtime.
    pub fn compile(patterns: &[String]) -> Result<Self, ProxyError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let normalized = normalize_domain(pattern).map_err(|error| {
                ProxyError::InvalidBypassPattern {
                    pattern: pattern.clone(),
                    reason: error.reason(),
                }
            })?;
            if normalized.wildcard {
                compiled.push(BypassPattern::Suffix(normalized.name));
            } else {
                compiled.push(BypassPattern::Exact(normalized.name));
            }
        }
        Ok(Self { patterns: compiled })
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns.iter().any(|pattern| match pattern {
            BypassPattern::Exact(name) => host == *name,
            BypassPattern::Suffix(name) => {
                host == *name
                    || (host.len() > name.len()
                        && host.ends_with(name.as_str())
                        && host.as_bytes()[host.len() - name.len() - 1] == b'.')
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::BypassList;

    #[test]
    fn exact_and_suffix_matching() {
        let list = BypassList::compile(&[
            "login.bank.example".to_string(),
            "*.pinned.example".to_string(),
        ])
        .expect("compile");

        assert!(list.matches("login.bank.example"));
        assert!(list.matches("LOGIN.BANK.EXAMPLE"));
        assert!(!list.matches("bank.example"));
        assert!(!list.matches("evil-login.bank.example.attacker.example"));

        assert!(list.matches("pinned.example"));
        assert!(list.matches("api.pinned.example"));
        assert!(!list.matches("unpinned.example"));
    }

    #[test]
    fn invalid_patterns_are_rejected_at_compile() {
        let error = BypassList::compile(&["not a domain".to_string()]).unwrap_err();
        assert!(error.to_string().contains("not a domain"));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = BypassList::compile(&[]).expect("compile");
        assert!(list.is_empty());
        assert!(!list.matches("anything.example"));
    }
}
