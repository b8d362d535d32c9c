// Blob path patterns: `container/prefix/{name}.csv`
// Parameters capture up to the next literal character; a trailing parameter
// captures the rest of the blob name.

use crate::errors::PatternError;
use crate::models::{BlobIdentity, ContainerIdentity};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Route parameters extracted from a matched blob name
pub type RouteParams = HashMap<String, String>;

static CONTAINER_NAME: OnceLock<Regex> = OnceLock::new();
static PARAMETER_NAME: OnceLock<Regex> = OnceLock::new();

fn container_name_regex() -> &'static Regex {
    CONTAINER_NAME.get_or_init(|| {
        Regex::new(r"^\$?[A-Za-z0-9][A-Za-z0-9-]*$").expect("Invalid regex pattern")
    })
}

fn parameter_name_regex() -> &'static Regex {
    PARAMETER_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Parameter(String),
}

/// A parsed `container[/blob]` pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPathPattern {
    raw: String,
    container: String,
    blob: Option<Vec<Segment>>,
}

impl BlobPathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let raw = pattern.trim().to_string();
        let invalid = |reason: &str| PatternError::InvalidPath {
            path: raw.clone(),
            reason: reason.to_string(),
        };

        let (container, blob) = match raw.split_once('/') {
            Some((container, blob)) => (container, Some(blob)),
            None => (raw.as_str(), None),
        };

        if container.is_empty() {
            return Err(invalid("container name is empty"));
        }
        if !container_name_regex().is_match(container) {
            return Err(invalid("container name has invalid characters"));
        }

        let segments = match blob {
            Some(blob) if !blob.is_empty() => Some(parse_segments(&raw, blob)?),
            _ => None,
        };

        Ok(Self {
            container: container.to_ascii_lowercase(),
            blob: segments,
            raw,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// True for `container` patterns that match every blob in the container
    pub fn is_container_only(&self) -> bool {
        self.blob.is_none()
    }

    /// Parameter names in declaration order
    pub fn parameter_names(&self) -> Vec<&str> {
        self.blob
            .iter()
            .flatten()
            .filter_map(|segment| match segment {
                Segment::Parameter(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Match `container/blob`, returning the captured parameters
    pub fn try_match(&self, container: &str, blob: &str) -> Option<RouteParams> {
        if !self.container.eq_ignore_ascii_case(container) {
            return None;
        }
        match &self.blob {
            None => Some(RouteParams::new()),
            Some(segments) => match_segments(segments, blob),
        }
    }

    pub fn match_blob(&self, blob: &BlobIdentity) -> Option<RouteParams> {
        self.try_match(blob.container_name(), &blob.name)
    }

    /// Substitute parameters into the blob part of the pattern
    pub fn bind(&self, params: &RouteParams) -> Result<String, PatternError> {
        let segments = self.blob.as_ref().ok_or_else(|| PatternError::InvalidPath {
            path: self.raw.clone(),
            reason: "pattern names no blob".to_string(),
        })?;

        let mut bound = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => bound.push_str(text),
                Segment::Parameter(name) => {
                    let value = params.get(name).ok_or_else(|| PatternError::UnboundParameter {
                        pattern: self.raw.clone(),
                        parameter: name.clone(),
                    })?;
                    bound.push_str(value);
                }
            }
        }
        Ok(bound)
    }

    /// Bind the pattern into a blob of the given container's account
    pub fn bind_blob(
        &self,
        container: &ContainerIdentity,
        params: &RouteParams,
    ) -> Result<BlobIdentity, PatternError> {
        let name = self.bind(params)?;
        Ok(BlobIdentity::new(
            container.account.clone(),
            self.container.clone(),
            name,
        ))
    }
}

impl fmt::Display for BlobPathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn parse_segments(raw: &str, blob: &str) -> Result<Vec<Segment>, PatternError> {
    let mut segments = Vec::new();
    let mut rest = blob;

    while !rest.is_empty() {
        match rest.find('{') {
            Some(0) => {
                let close = rest
                    .find('}')
                    .ok_or_else(|| PatternError::MissingClosingBracket(raw.to_string()))?;
                let name = &rest[1..close];
                if !parameter_name_regex().is_match(name) {
                    return Err(PatternError::InvalidPath {
                        path: raw.to_string(),
                        reason: format!("invalid parameter name '{}'", name),
                    });
                }
                if matches!(segments.last(), Some(Segment::Parameter(_))) {
                    return Err(PatternError::InvalidPath {
                        path: raw.to_string(),
                        reason: "adjacent parameters need a literal separator".to_string(),
                    });
                }
                segments.push(Segment::Parameter(name.to_string()));
                rest = &rest[close + 1..];
            }
            Some(open) => {
                segments.push(Segment::Literal(rest[..open].to_string()));
                rest = &rest[open..];
            }
            None => {
                if rest.contains('}') {
                    return Err(PatternError::InvalidPath {
                        path: raw.to_string(),
                        reason: "unmatched '}'".to_string(),
                    });
                }
                segments.push(Segment::Literal(rest.to_string()));
                rest = "";
            }
        }
    }

    Ok(segments)
}

fn match_segments(segments: &[Segment], actual: &str) -> Option<RouteParams> {
    // `{name}.ext`: the extension is matched from the end so dots inside the
    // captured value are allowed
    if let [head @ .., Segment::Parameter(_), Segment::Literal(ext)] = segments {
        if is_extension(ext) {
            let split = actual.len().checked_sub(ext.len())?;
            if !actual.is_char_boundary(split) || !actual[split..].eq_ignore_ascii_case(ext) {
                return None;
            }
            let stripped = &actual[..split];
            let without_ext = &segments[..head.len() + 1];
            return match_segments(without_ext, stripped);
        }
    }

    let mut params = RouteParams::new();
    let mut position = 0;

    for (index, segment) in segments.iter().enumerate() {
        let remaining = &actual[position..];
        match segment {
            Segment::Literal(text) => {
                if !remaining.starts_with(text.as_str()) {
                    return None;
                }
                position += text.len();
            }
            Segment::Parameter(name) => {
                let value = match segments.get(index + 1) {
                    Some(Segment::Literal(next)) => {
                        let stop = next.chars().next()?;
                        let end = remaining.find(stop)?;
                        &remaining[..end]
                    }
                    _ => remaining,
                };
                position += value.len();
                params.insert(name.clone(), value.to_string());
            }
        }
    }

    (position == actual.len()).then_some(params)
}

fn is_extension(literal: &str) -> bool {
    literal.len() > 1 && literal.starts_with('.') && !literal[1..].contains(['.', '/'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountIdentity;

    fn params(pairs: &[(&str, &str)]) -> RouteParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_container_only_matches_any_blob() {
        let pattern = BlobPathPattern::parse("input").unwrap();
        assert!(pattern.is_container_only());
        assert_eq!(pattern.try_match("input", "a/b/c.txt"), Some(RouteParams::new()));
        assert_eq!(pattern.try_match("other", "a.txt"), None);
    }

    #[test]
    fn test_extension_comparison_ignores_case() {
        let pattern = BlobPathPattern::parse("data/{name}.CSV").unwrap();
        assert_eq!(
            pattern.try_match("data", "a.b.csv"),
            Some(params(&[("name", "a.b")]))
        );
        assert_eq!(pattern.try_match("data", "a.txt"), None);
        assert_eq!(pattern.try_match("data", "é"), None);
    }

    #[test]
    fn test_container_comparison_ignores_case() {
        let pattern = BlobPathPattern::parse("Input/{name}").unwrap();
        assert_eq!(pattern.container(), "input");
        assert_eq!(
            pattern.try_match("input", "a.txt"),
            Some(params(&[("name", "a.txt")]))
        );
    }

    #[test]
    fn test_parameter_stops_at_next_literal() {
        let pattern = BlobPathPattern::parse("input/{year}-{month}/{file}").unwrap();
        assert_eq!(
            pattern.try_match("input", "2024-03/report.txt"),
            Some(params(&[("year", "2024"), ("month", "03"), ("file", "report.txt")]))
        );
    }

    #[test]
    fn test_extension_matched_from_end() {
        let pattern = BlobPathPattern::parse("input/{name}.csv").unwrap();
        assert_eq!(
            pattern.try_match("input", "a.b.csv"),
            Some(params(&[("name", "a.b")]))
        );
        assert_eq!(pattern.try_match("input", "a.b.txt"), None);
    }

    #[test]
    fn test_literal_mismatch_is_no_match() {
        let pattern = BlobPathPattern::parse("input/reports/{name}").unwrap();
        assert_eq!(pattern.try_match("input", "images/a.png"), None);

        let exact = BlobPathPattern::parse("input/a.txt").unwrap();
        assert!(exact.try_match("input", "a.txt").is_some());
        assert!(exact.try_match("input", "a.txt.bak").is_none());
    }

    #[test]
    fn test_missing_closing_bracket() {
        assert_eq!(
            BlobPathPattern::parse("input/{name"),
            Err(PatternError::MissingClosingBracket("input/{name".to_string()))
        );
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(BlobPathPattern::parse("").is_err());
        assert!(BlobPathPattern::parse("/blob").is_err());
        assert!(BlobPathPattern::parse("in put/x").is_err());
        assert!(BlobPathPattern::parse("input/{}").is_err());
        assert!(BlobPathPattern::parse("input/{a}{b}").is_err());
        assert!(BlobPathPattern::parse("input/a}").is_err());
    }

    #[test]
    fn test_bind_substitutes_parameters() {
        let pattern = BlobPathPattern::parse("output/{name}.out").unwrap();
        assert_eq!(pattern.bind(&params(&[("name", "a.b")])).unwrap(), "a.b.out");

        let container = ContainerIdentity::new(AccountIdentity::new("prod"), "input");
        let blob = pattern
            .bind_blob(&container, &params(&[("name", "x")]))
            .unwrap();
        assert_eq!(blob.path(), "output/x.out");
        assert_eq!(blob.account(), &AccountIdentity::new("prod"));
    }

    #[test]
    fn test_bind_missing_parameter() {
        let pattern = BlobPathPattern::parse("output/{name}").unwrap();
        assert_eq!(
            pattern.bind(&RouteParams::new()),
            Err(PatternError::UnboundParameter {
                pattern: "output/{name}".to_string(),
                parameter: "name".to_string(),
            })
        );
    }

    #[test]
    fn test_parameter_names_in_order() {
        let pattern = BlobPathPattern::parse("input/{a}/{b}.json").unwrap();
        assert_eq!(pattern.parameter_names(), vec!["a", "b"]);
    }
}
