//! Filter engine: compiles the supported filter-list subset into a compiled
//! rule snapshot and answers block/allow/redirect queries for the packet
//! inspector and the proxy.

use std::sync::Arc;

use guard_index::{DomainRule, DomainSet, DomainSnapshot};
use thiserror::Error;

mod parse;
mod pattern;
mod types;

pub use parse::{parse_line, LineError, ParsedLine, Pattern};
pub use pattern::{PatternError, UrlMatcher};
pub use types::{
    domain_scope_matches, same_site, CosmeticRule, PartyConstraint, ResourceMask, ResourceType,
    RuleOptions,
};

#[derive(Debug, Error)]
pub enum RuleCompileError {
    #[error("index build failed: {0}")]
    Index(#[from] guard_index::IndexError),
}

/// A rule line that failed to compile; recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub source_id: String,
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Block { rule: Arc<str> },
    Allow { rule: Arc<str> },
    Redirect { target: String, rule: Arc<str> },
    Pass,
}

impl FilterDecision {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRequest<'a> {
    pub url: &'a str,
    pub domain: &'a str,
    pub resource_type: ResourceType,
    pub initiator: Option<&'a str>,
}

struct RedirectRule {
    matcher: UrlMatcher,
    target: String,
}

/// Immutable compiled rule snapshot. Built once per reload; readers share
/// it through an `Arc` and never observe partial state.
pub struct RuleSet {
    block_index: Arc<DomainSnapshot>,
    allow_index: Arc<DomainSnapshot>,
    block_patterns: Vec<UrlMatcher>,
    allow_patterns: Vec<UrlMatcher>,
    redirect_rules: Vec<RedirectRule>,
    cosmetic_rules: Vec<CosmeticRule>,
    skipped: Vec<SkippedLine>,
    generation: u64,
}

/// One named blob of rule text, compiled in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSourceText {
    pub id: String,
    pub text: String,
}

impl RuleSet {
    pub fn empty() -> Arc<Self> {
        Self::compile(&[], 0).expect("empty rule set always compiles")
    }

    pub fn compile(
        sources: &[RuleSourceText],
        generation: u64,
    ) -> Result<Arc<Self>, RuleCompileError> {
        let mut block_domains: Vec<DomainRule> = Vec::new();
        let mut allow_domains: Vec<DomainRule> = Vec::new();
        let mut block_patterns = Vec::new();
        let mut allow_patterns = Vec::new();
        let mut redirect_rules = Vec::new();
        let mut cosmetic_rules = Vec::new();
        let mut skipped = Vec::new();

        for source in sources {
            for (line_index, line) in source.text.lines().enumerate() {
                match parse_line(line) {
                    Ok(ParsedLine::Empty) | Ok(ParsedLine::Comment) => {}
                    Ok(ParsedLine::Cosmetic(rule)) => cosmetic_rules.push(rule),
                    Ok(ParsedLine::DomainRule { domain, allow }) => {
                        let rule = DomainRule::tagged(&domain, line.trim());
                        if allow {
                            allow_domains.push(rule);
                        } else {
                            block_domains.push(rule);
                        }
                    }
                    Ok(ParsedLine::PatternRule {
                        pattern,
                        options,
                        allow,
                        raw,
                    }) => {
                        let redirect_target = options.redirect.clone();
                        match UrlMatcher::compile(&pattern, options, raw) {
                            Ok(matcher) => match (allow, redirect_target) {
                                (false, Some(target)) => {
                                    redirect_rules.push(RedirectRule { matcher, target })
                                }
                                (false, None) => block_patterns.push(matcher),
                                (true, _) => allow_patterns.push(matcher),
                            },
                            Err(error) => skipped.push(SkippedLine {
                                source_id: source.id.clone(),
                                line_number: line_index + 1,
                                line: line.trim().to_string(),
                                reason: error.to_string(),
                            }),
                        }
                    }
                    Err(error) => skipped.push(SkippedLine {
                        source_id: source.id.clone(),
                        line_number: line_index + 1,
                        line: line.trim().to_string(),
                        reason: error.to_string(),
                    }),
                }
            }
        }

        // A malformed domain inside an otherwise well-formed rule line is a
        // skip, not a build failure; drop those before the index build.
        let block_index = build_index_skipping_invalid(block_domains, &mut skipped);
        let allow_index = build_index_skipping_invalid(allow_domains, &mut skipped);

        Ok(Arc::new(Self {
            block_index,
            allow_index,
            block_patterns,
            allow_patterns,
            redirect_rules,
            cosmetic_rules,
            skipped,
            generation,
        }))
    }

    /// Decision order: Allow beats Block unless the Block carries
    /// `important`; Redirect applies only when nothing allowed the request.
    pub fn decide(&self, request: &FilterRequest<'_>) -> FilterDecision {
        let url = request.url.to_ascii_lowercase();
        let domain = request.domain.to_ascii_lowercase();
        let initiator = request.initiator.map(str::to_ascii_lowercase);
        let initiator = initiator.as_deref();

        let allow = self.find_allow(&url, &domain, request.resource_type, initiator);
        let block = self.find_block(&url, &domain, request.resource_type, initiator);

        if let Some((rule, important)) = block {
            if important {
                return FilterDecision::Block { rule };
            }
            if let Some(allow_rule) = allow {
                return FilterDecision::Allow { rule: allow_rule };
            }
            return FilterDecision::Block { rule };
        }

        if let Some(allow_rule) = allow {
            return FilterDecision::Allow { rule: allow_rule };
        }

        for redirect in &self.redirect_rules {
            if redirect.matcher.matches_url(&url)
                && redirect
                    .matcher
                    .options
                    .matches(request.resource_type, &domain, initiator)
            {
                return FilterDecision::Redirect {
                    target: redirect.target.clone(),
                    rule: Arc::from(redirect.matcher.raw.as_str()),
                };
            }
        }

        FilterDecision::Pass
    }

    /// Domain-only convenience used by the packet inspector, where no URL
    /// exists yet.
    pub fn decide_domain(&self, domain: &str) -> FilterDecision {
        let url = format!("https://{domain}/");
        self.decide(&FilterRequest {
            url: &url,
            domain,
            resource_type: ResourceType::Other,
            initiator: None,
        })
    }

    fn find_allow(
        &self,
        url: &str,
        domain: &str,
        resource_type: ResourceType,
        initiator: Option<&str>,
    ) -> Option<Arc<str>> {
        let index_hit = self.allow_index.lookup(domain);
        if index_hit.blocked {
            return Some(
                index_hit
                    .rule_tag
                    .unwrap_or_else(|| Arc::from(domain)),
            );
        }
        self.allow_patterns
            .iter()
            .find(|matcher| {
                matcher.matches_url(url)
                    && matcher.options.matches(resource_type, domain, initiator)
            })
            .map(|matcher| Arc::from(matcher.raw.as_str()))
    }

    fn find_block(
        &self,
        url: &str,
        domain: &str,
        resource_type: ResourceType,
        initiator: Option<&str>,
    ) -> Option<(Arc<str>, bool)> {
        let mut unimportant: Option<Arc<str>> = None;

        let index_hit = self.block_index.lookup(domain);
        if index_hit.blocked {
            unimportant = Some(index_hit.rule_tag.unwrap_or_else(|| Arc::from(domain)));
        }

        for matcher in &self.block_patterns {
            if !matcher.matches_url(url)
                || !matcher.options.matches(resource_type, domain, initiator)
            {
                continue;
            }
            if matcher.options.important {
                return Some((Arc::from(matcher.raw.as_str()), true));
            }
            if unimportant.is_none() {
                unimportant = Some(Arc::from(matcher.raw.as_str()));
            }
        }

        unimportant.map(|rule| (rule, false))
    }

    pub fn domain_index(&self) -> &Arc<DomainSnapshot> {
        &self.block_index
    }

    pub fn cosmetic_rules(&self) -> &[CosmeticRule] {
        &self.cosmetic_rules
    }

    pub fn skipped_lines(&self) -> &[SkippedLine] {
        &self.skipped
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn total_domains(&self) -> usize {
        self.block_index.total_domains()
    }
}

fn build_index_skipping_invalid(
    rules: Vec<DomainRule>,
    skipped: &mut Vec<SkippedLine>,
) -> Arc<DomainSnapshot> {
    let mut valid = Vec::with_capacity(rules.len());
    for rule in rules {
        match guard_index::normalize_domain(&rule.domain) {
            Ok(_) => valid.push(rule),
            Err(error) => skipped.push(SkippedLine {
                source_id: String::new(),
                line_number: 0,
                line: rule.domain.clone(),
                reason: error.reason().to_string(),
            }),
        }
    }
    DomainSet::build(valid).expect("pre-validated domains always build")
}
