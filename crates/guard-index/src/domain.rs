//! Domain normalization shared by the index and the filter compiler.

pub const MAX_LABEL_OCTETS: usize = 63;
pub const MAX_DOMAIN_OCTETS: usize = 253;

/// A case-folded domain name, optionally carrying a single leading `*.`
/// wildcard label. `name` never contains the wildcard marker itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedDomain {
    pub name: String,
    pub wildcard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainParseError {
    Empty,
    LabelTooLong,
    NameTooLong,
    BadCharacter,
    BadLabel,
}

impl DomainParseError {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Empty => "empty domain",
            Self::LabelTooLong => "label exceeds 63 octets",
            Self::NameTooLong => "name exceeds 253 octets",
            Self::BadCharacter => "character outside [a-z0-9-.]",
            Self::BadLabel => "empty label or wildcard not in leading position",
        }
    }
}

/// Normalizes `raw` into a domain suitable for the index: lowercases, trims
/// whitespace and trailing dots, strips URL scheme, path, port, and adblock
/// decorations (`||` prefix, `^` suffix). A single leading `*.` marks a
/// wildcard. Fails when the remaining name violates the label invariants.
pub fn normalize_domain(raw: &str) -> Result<NormalizedDomain, DomainParseError> {
    let mut rest = raw.trim();

    if let Some(stripped) = rest.strip_prefix("||") {
        rest = stripped;
    }
    if let Some(scheme_end) = rest.find("://") {
        rest = &rest[scheme_end + 3..];
    }
    if let Some(path_start) = rest.find(['/', '?', '#', '^']) {
        rest = &rest[..path_start];
    }
    // A trailing :port, but not an IPv6 literal (those are never domains).
    if let Some(colon) = rest.rfind(':') {
        if rest[colon + 1..].bytes().all(|byte| byte.is_ascii_digit()) {
            rest = &rest[..colon];
        }
    }

    let (wildcard, rest) = match rest.strip_prefix("*.") {
        Some(stripped) => (true, stripped),
        None => (false, rest),
    };

    let trimmed = rest.trim_matches('.');
    if trimmed.is_empty() {
        return Err(DomainParseError::Empty);
    }

    let name = trimmed.to_ascii_lowercase();
    validate_name(&name)?;
    Ok(NormalizedDomain { name, wildcard })
}

fn validate_name(name: &str) -> Result<(), DomainParseError> {
    if name.len() > MAX_DOMAIN_OCTETS {
        return Err(DomainParseError::NameTooLong);
    }
    for label in name.split('.') {
        if label.is_empty() || label.contains('*') {
            return Err(DomainParseError::BadLabel);
        }
        if label.len() > MAX_LABEL_OCTETS {
            return Err(DomainParseError::LabelTooLong);
        }
        if !label
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-')
        {
            return Err(DomainParseError::BadCharacter);
        }
    }
    Ok(())
}

/// Normalizes a query-side hostname: lowercase, strip one trailing dot.
/// Returns `None` when the invariants fail, which lookup treats as
/// non-match rather than an error.
pub fn normalize_query(host: &str) -> Option<String> {
    let trimmed = host.trim().strip_suffix('.').unwrap_or_else(|| host.trim());
    if trimmed.is_empty() {
        return None;
    }
    let name = trimmed.to_ascii_lowercase();
    validate_name(&name).ok()?;
    Some(name)
}
