use bitflags::bitflags;

bitflags! {
    /// Resource classes a rule may be restricted to. An empty mask means
    /// the rule applies to every class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceMask: u16 {
        const SCRIPT = 1 << 0;
        const IMAGE = 1 << 1;
        const STYLESHEET = 1 << 2;
        const XHR = 1 << 3;
        const DOCUMENT = 1 << 4;
        const FONT = 1 << 5;
        const MEDIA = 1 << 6;
        const WEBSOCKET = 1 << 7;
        const OTHER = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Script,
    Image,
    Stylesheet,
    Xhr,
    Document,
    Font,
    Media,
    Websocket,
    Other,
}

impl ResourceType {
    pub fn mask(self) -> ResourceMask {
        match self {
            Self::Script => ResourceMask::SCRIPT,
            Self::Image => ResourceMask::IMAGE,
            Self::Stylesheet => ResourceMask::STYLESHEET,
            Self::Xhr => ResourceMask::XHR,
            Self::Document => ResourceMask::DOCUMENT,
            Self::Font => ResourceMask::FONT,
            Self::Media => ResourceMask::MEDIA,
            Self::Websocket => ResourceMask::WEBSOCKET,
            Self::Other => ResourceMask::OTHER,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Image => "image",
            Self::Stylesheet => "stylesheet",
            Self::Xhr => "xhr",
            Self::Document => "document",
            Self::Font => "font",
            Self::Media => "media",
            Self::Websocket => "websocket",
            Self::Other => "other",
        }
    }
}

/// Party restriction parsed from `$third-party` / `$1p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartyConstraint {
    #[default]
    Any,
    ThirdParty,
    FirstParty,
}

/// `$...` options attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleOptions {
    pub party: PartyConstraint,
    pub resource_types: ResourceMask,
    pub included_domains: Vec<String>,
    pub excluded_domains: Vec<String>,
    pub important: bool,
    pub redirect: Option<String>,
}

impl RuleOptions {
    pub fn is_plain(&self) -> bool {
        self.party == PartyConstraint::Any
            && self.resource_types.is_empty()
            && self.included_domains.is_empty()
            && self.excluded_domains.is_empty()
            && !self.important
            && self.redirect.is_none()
    }

    /// Evaluates the option constraints against a concrete request.
    pub fn matches(
        &self,
        resource_type: ResourceType,
        request_domain: &str,
        initiator: Option<&str>,
    ) -> bool {
        if !self.resource_types.is_empty() && !self.resource_types.contains(resource_type.mask()) {
            return false;
        }

        match self.party {
            PartyConstraint::Any => {}
            PartyConstraint::ThirdParty => {
                if let Some(initiator) = initiator {
                    if same_site(request_domain, initiator) {
                        return false;
                    }
                }
            }
            PartyConstraint::FirstParty => {
                if let Some(initiator) = initiator {
                    if !same_site(request_domain, initiator) {
                        return false;
                    }
                }
            }
        }

        if !self.included_domains.is_empty() {
            // Inclusion needs a known initiator to be satisfiable.
            let Some(initiator) = initiator else {
                return false;
            };
            if !self
                .included_domains
                .iter()
                .any(|candidate| domain_scope_matches(candidate, initiator))
            {
                return false;
            }
        }

        if let Some(initiator) = initiator {
            if self
                .excluded_domains
                .iter()
                .any(|candidate| domain_scope_matches(candidate, initiator))
            {
                return false;
            }
        }

        true
    }
}

/// Exact match, or suffix with a leading dot: `example.com` scopes both
/// `example.com` and `sub.example.com`.
pub fn domain_scope_matches(scope: &str, domain: &str) -> bool {
    domain == scope
        || (domain.len() > scope.len()
            && domain.ends_with(scope)
            && domain.as_bytes()[domain.len() - scope.len() - 1] == b'.')
}

/// Two hosts belong to the same site when either equals the other or is a
/// dot-separated suffix of it.
pub fn same_site(left: &str, right: &str) -> bool {
    domain_scope_matches(left, right) || domain_scope_matches(right, left)
}

/// Cosmetic rule surfaced to the shell; the interception core never
/// consumes these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmeticRule {
    pub selector: String,
    pub included_domains: Vec<String>,
    pub excluded_domains: Vec<String>,
    pub exception: bool,
}

#[cfg(test)]
mod tests {
    use super::{
        domain_scope_matches, same_site, PartyConstraint, ResourceMask, ResourceType, RuleOptions,
    };

    #[test]
    fn domain_scope_requires_label_boundary() {
        assert!(domain_scope_matches("example.com", "example.com"));
        assert!(domain_scope_matches("example.com", "sub.example.com"));
        assert!(!domain_scope_matches("example.com", "notexample.com"));
        assert!(!domain_scope_matches("sub.example.com", "example.com"));
    }

    #[test]
    fn same_site_is_symmetric() {
        assert!(same_site("a.example.com", "example.com"));
        assert!(same_site("example.com", "a.example.com"));
        assert!(!same_site("example.com", "example.org"));
    }

    #[test]
    fn resource_type_constraint() {
        let options = RuleOptions {
            resource_types: ResourceMask::SCRIPT | ResourceMask::IMAGE,
            ..RuleOptions::default()
        };
        assert!(options.matches(ResourceType::Script, "ads.example.com", None));
        assert!(!options.matches(ResourceType::Document, "ads.example.com", None));
    }

    #[test]
    fn third_party_constraint_needs_cross_site_initiator() {
        let options = RuleOptions {
            party: PartyConstraint::ThirdParty,
            ..RuleOptions::default()
        };
        assert!(options.matches(ResourceType::Script, "ads.example.com", Some("news.example")));
        assert!(!options.matches(
            ResourceType::Script,
            "ads.example.com",
            Some("example.com")
        ));
        // Unknown initiator cannot disprove third-party.
        assert!(options.matches(ResourceType::Script, "ads.example.com", None));
    }

    #[test]
    fn included_domains_require_initiator() {
        let options = RuleOptions {
            included_domains: vec!["news.example".to_string()],
            ..RuleOptions::default()
        };
        assert!(options.matches(
            ResourceType::Script,
            "ads.example.com",
            Some("news.example")
        ));
        assert!(options.matches(
            ResourceType::Script,
            "ads.example.com",
            Some("sport.news.example")
        ));
        assert!(!options.matches(ResourceType::Script, "ads.example.com", Some("other.example")));
        assert!(!options.matches(ResourceType::Script, "ads.example.com", None));
    }
}
