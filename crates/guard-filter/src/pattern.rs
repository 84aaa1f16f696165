//! Compilation of parsed patterns into anchored regular expressions with a
//! cheap required-literal gate in front of each.

use regex::Regex;

use crate::parse::Pattern;
use crate::types::RuleOptions;

/// Minimum length for a literal to be worth gating on.
const MIN_LITERAL_LEN: usize = 3;

#[derive(Debug)]
pub struct UrlMatcher {
    regex: Regex,
    required_literal: Option<String>,
    pub options: RuleOptions,
    pub raw: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("regex compilation failed: {0}")]
    Regex(#[from] regex::Error),
}

impl UrlMatcher {
    pub fn compile(
        pattern: &Pattern,
        options: RuleOptions,
        raw: String,
    ) -> Result<Self, PatternError> {
        let source = regex_source(pattern);
        let regex = Regex::new(&source)?;
        let required_literal = required_literal(pattern);
        Ok(Self {
            regex,
            required_literal,
            options,
            raw,
        })
    }

    /// `url` must already be lowercased by the caller.
    pub fn matches_url(&self, url: &str) -> bool {
        if let Some(literal) = &self.required_literal {
            if !url.contains(literal.as_str()) {
                return false;
            }
        }
        self.regex.is_match(url)
    }
}

fn regex_source(pattern: &Pattern) -> String {
    match pattern {
        Pattern::HostnameAnchor(rest) => {
            format!("^https?://([a-z0-9-]+\\.)*{}", translate_body(rest))
        }
        Pattern::PrefixAnchor(rest) => format!("^{}", translate_body(rest)),
        Pattern::SuffixAnchor(rest) => format!("{}$", translate_body(rest)),
        Pattern::RawRegex(body) => body.clone(),
        Pattern::Substring(rest) => translate_body(rest),
    }
}

/// Translates the filter-pattern metacharacters: `*` is any run of
/// characters, `^` is the separator class, everything else matches
/// literally.
fn translate_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    for ch in body.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '^' => out.push_str("(?:[/?#]|$)"),
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' | '$' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out
}

/// Longest literal run (no `*`/`^`) in the pattern body, lowercased.
fn required_literal(pattern: &Pattern) -> Option<String> {
    let body = match pattern {
        Pattern::HostnameAnchor(rest)
        | Pattern::PrefixAnchor(rest)
        | Pattern::SuffixAnchor(rest)
        | Pattern::Substring(rest) => rest,
        Pattern::RawRegex(_) => return None,
    };

    body.split(['*', '^'])
        .max_by_key(|segment| segment.len())
        .filter(|segment| segment.len() >= MIN_LITERAL_LEN)
        .map(|segment| segment.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::UrlMatcher;
    use crate::parse::Pattern;
    use crate::types::RuleOptions;

    fn compile(pattern: Pattern) -> UrlMatcher {
        UrlMatcher::compile(&pattern, RuleOptions::default(), "test".to_string())
            .expect("compile pattern")
    }

    #[test]
    fn hostname_anchor_matches_domain_and_subdomains() {
        let matcher = compile(Pattern::HostnameAnchor("tracker.example.com^".to_string()));
        assert!(matcher.matches_url("http://tracker.example.com/pixel.gif"));
        assert!(matcher.matches_url("https://cdn.tracker.example.com/x"));
        assert!(matcher.matches_url("https://tracker.example.com"));
        assert!(!matcher.matches_url("https://nottracker.example.com/"));
        assert!(!matcher.matches_url("https://tracker.example.community/"));
    }

    #[test]
    fn separator_class_matches_delimiters_and_end() {
        let matcher = compile(Pattern::Substring("/ad^".to_string()));
        assert!(matcher.matches_url("https://x.example/ad?id=1"));
        assert!(matcher.matches_url("https://x.example/ad"));
        assert!(!matcher.matches_url("https://x.example/admin"));
    }

    #[test]
    fn wildcard_translates_to_any_run() {
        let matcher = compile(Pattern::Substring("/banner/*/img".to_string()));
        assert!(matcher.matches_url("https://x.example/banner/2024/img"));
        assert!(!matcher.matches_url("https://x.example/banner-img"));
    }

    #[test]
    fn prefix_and_suffix_anchors() {
        let prefix = compile(Pattern::PrefixAnchor("https://ads.".to_string()));
        assert!(prefix.matches_url("https://ads.example.com/x"));
        assert!(!prefix.matches_url("https://example.com/https://ads."));

        let suffix = compile(Pattern::SuffixAnchor(".gif".to_string()));
        assert!(suffix.matches_url("https://x.example/pixel.gif"));
        assert!(!suffix.matches_url("https://x.example/pixel.gif?x=1"));
    }

    #[test]
    fn raw_regex_is_used_verbatim() {
        let matcher = compile(Pattern::RawRegex("banner[0-9]{2}".to_string()));
        assert!(matcher.matches_url("https://x.example/banner42.png"));
        assert!(!matcher.matches_url("https://x.example/banner4.png"));
    }

    #[test]
    fn literal_gate_short_circuits() {
        let matcher = compile(Pattern::Substring("verylongliteral*tail".to_string()));
        assert!(!matcher.matches_url("https://x.example/other"));
        assert!(matcher.matches_url("https://x.example/verylongliteral/and/tail"));
    }
}
