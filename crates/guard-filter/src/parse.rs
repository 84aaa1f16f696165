//! Line-level parsing of the supported filter-list subset.

use std::net::IpAddr;

use crate::types::{CosmeticRule, PartyConstraint, ResourceMask, RuleOptions};

/// One classified line of rule text, before pattern compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// `||domain^` or hosts-file form, no options: pure index entry.
    DomainRule {
        domain: String,
        allow: bool,
    },
    /// Anything that needs a URL matcher (anchors, wildcards, options).
    PatternRule {
        pattern: Pattern,
        options: RuleOptions,
        allow: bool,
        raw: String,
    },
    Cosmetic(CosmeticRule),
    Comment,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// `||rest`: hostname anchor; `rest` starts at the domain.
    HostnameAnchor(String),
    /// `|rest`: URL prefix anchor.
    PrefixAnchor(String),
    /// `rest|`: URL suffix anchor.
    SuffixAnchor(String),
    /// `/regex/`: raw regular expression, anchored as written.
    RawRegex(String),
    /// Plain substring pattern with `*` / `^` metacharacters.
    Substring(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("empty domain option")]
    EmptyDomainOption,
    #[error("empty pattern")]
    EmptyPattern,
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
}

pub fn parse_line(raw_line: &str) -> Result<ParsedLine, LineError> {
    let line = raw_line.trim();
    if line.is_empty() {
        return Ok(ParsedLine::Empty);
    }
    if line.starts_with('!') || line.starts_with('[') {
        return Ok(ParsedLine::Comment);
    }

    if let Some(cosmetic) = parse_cosmetic(line) {
        return Ok(ParsedLine::Cosmetic(cosmetic));
    }
    // A bare `#` comment, but only once cosmetic separators are ruled out.
    if line.starts_with('#') {
        return Ok(ParsedLine::Comment);
    }

    let (allow, line) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let (pattern_part, options_part) = split_options(line);
    let options = match options_part {
        Some(text) => parse_options(text)?,
        None => RuleOptions::default(),
    };

    let pattern_part = pattern_part.trim();
    if pattern_part.is_empty() {
        return Err(LineError::EmptyPattern);
    }

    if let Some(domain) = parse_hosts_file_line(pattern_part) {
        if options.is_plain() {
            return Ok(ParsedLine::DomainRule { domain, allow });
        }
        return Ok(ParsedLine::PatternRule {
            pattern: Pattern::HostnameAnchor(format!("{domain}^")),
            options,
            allow,
            raw: raw_line.trim().to_string(),
        });
    }

    if let Some(domain) = parse_pure_domain_anchor(pattern_part) {
        if options.is_plain() {
            return Ok(ParsedLine::DomainRule { domain, allow });
        }
        return Ok(ParsedLine::PatternRule {
            pattern: Pattern::HostnameAnchor(format!("{domain}^")),
            options,
            allow,
            raw: raw_line.trim().to_string(),
        });
    }

    let pattern = classify_pattern(pattern_part)?;
    Ok(ParsedLine::PatternRule {
        pattern,
        options,
        allow,
        raw: raw_line.trim().to_string(),
    })
}

fn split_options(line: &str) -> (&str, Option<&str>) {
    // `$` inside a /regex/ body is part of the expression, not an options
    // separator.
    if line.starts_with('/') && line.ends_with('/') && line.len() > 1 {
        return (line, None);
    }
    match line.rfind('$') {
        Some(position) if position + 1 < line.len() => {
            (&line[..position], Some(&line[position + 1..]))
        }
        _ => (line, None),
    }
}

fn parse_options(text: &str) -> Result<RuleOptions, LineError> {
    let mut options = RuleOptions::default();

    for raw_option in text.split(',') {
        let option = raw_option.trim().to_ascii_lowercase();
        if option.is_empty() {
            continue;
        }

        if option == "important" {
            options.important = true;
            continue;
        }
        if option == "third-party" || option == "3p" {
            options.party = PartyConstraint::ThirdParty;
            continue;
        }
        if option == "first-party" || option == "1p" || option == "~third-party" {
            options.party = PartyConstraint::FirstParty;
            continue;
        }
        if let Some(value) = option.strip_prefix("domain=") {
            parse_domain_option(value, &mut options)?;
            continue;
        }
        if let Some(value) = option.strip_prefix("redirect=") {
            if !value.is_empty() {
                options.redirect = Some(value.to_string());
            }
            continue;
        }
        if let Some(mask) = resource_option(&option) {
            options.resource_types |= mask;
            continue;
        }

        return Err(LineError::UnknownOption(option));
    }

    Ok(options)
}

fn parse_domain_option(value: &str, options: &mut RuleOptions) -> Result<(), LineError> {
    let mut seen = false;
    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        seen = true;
        let (excluded, name) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let normalized = guard_index::normalize_domain(name)
            .map_err(|_| LineError::InvalidDomain(name.to_string()))?;
        if excluded {
            options.excluded_domains.push(normalized.name);
        } else {
            options.included_domains.push(normalized.name);
        }
    }

    if !seen {
        return Err(LineError::EmptyDomainOption);
    }
    Ok(())
}

fn resource_option(name: &str) -> Option<ResourceMask> {
    match name {
        "script" => Some(ResourceMask::SCRIPT),
        "image" => Some(ResourceMask::IMAGE),
        "stylesheet" => Some(ResourceMask::STYLESHEET),
        "xmlhttprequest" | "xhr" => Some(ResourceMask::XHR),
        "document" => Some(ResourceMask::DOCUMENT),
        "font" => Some(ResourceMask::FONT),
        "media" => Some(ResourceMask::MEDIA),
        "websocket" => Some(ResourceMask::WEBSOCKET),
        "other" => Some(ResourceMask::OTHER),
        _ => None,
    }
}

/// `||domain^` or `||domain` with nothing after the host part.
fn parse_pure_domain_anchor(pattern: &str) -> Option<String> {
    let rest = pattern.strip_prefix("||")?;
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    let rest = rest.strip_suffix('^').unwrap_or(rest);

    if rest.is_empty()
        || rest.contains(['/', '?', '#', '^', ':', '|'])
        || rest.contains('*') && !rest.starts_with("*.")
    {
        return None;
    }

    guard_index::normalize_domain(rest).ok().map(|normalized| {
        if normalized.wildcard {
            format!("*.{}", normalized.name)
        } else {
            normalized.name
        }
    })
}

/// `0.0.0.0 domain` / `127.0.0.1 domain` hosts-file lines.
fn parse_hosts_file_line(pattern: &str) -> Option<String> {
    let mut parts = pattern.split_whitespace();
    let address = parts.next()?;
    let host = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    address.parse::<IpAddr>().ok()?;
    guard_index::normalize_domain(host)
        .ok()
        .map(|normalized| normalized.name)
}

fn classify_pattern(pattern: &str) -> Result<Pattern, LineError> {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        return Ok(Pattern::RawRegex(pattern[1..pattern.len() - 1].to_string()));
    }
    if let Some(rest) = pattern.strip_prefix("||") {
        if rest.is_empty() {
            return Err(LineError::EmptyPattern);
        }
        return Ok(Pattern::HostnameAnchor(rest.to_string()));
    }
    if let Some(rest) = pattern.strip_prefix('|') {
        if rest.is_empty() {
            return Err(LineError::EmptyPattern);
        }
        return Ok(Pattern::PrefixAnchor(rest.trim_end_matches('|').to_string()));
    }
    if let Some(rest) = pattern.strip_suffix('|') {
        if rest.is_empty() {
            return Err(LineError::EmptyPattern);
        }
        return Ok(Pattern::SuffixAnchor(rest.to_string()));
    }
    Ok(Pattern::Substring(pattern.to_string()))
}

fn parse_cosmetic(line: &str) -> Option<CosmeticRule> {
    for (token, exception) in [("#@#", true), ("#?#", false), ("##", false)] {
        if let Some(position) = line.find(token) {
            let scope = &line[..position];
            let selector = line[position + token.len()..].trim();
            if selector.is_empty() {
                return None;
            }

            let mut included = Vec::new();
            let mut excluded = Vec::new();
            for raw in scope.split(',') {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                let (negated, name) = match raw.strip_prefix('~') {
                    Some(rest) => (true, rest),
                    None => (false, raw),
                };
                let Ok(normalized) = guard_index::normalize_domain(name) else {
                    return None;
                };
                if negated {
                    excluded.push(normalized.name);
                } else {
                    included.push(normalized.name);
                }
            }

            return Some(CosmeticRule {
                selector: selector.to_string(),
                included_domains: included,
                excluded_domains: excluded,
                exception,
            });
        }
    }
    None
}
