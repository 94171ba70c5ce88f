//! Topic Names and Filters
//!
//! MQTT topics are slash-delimited strings (`sensors/floor1/temp`). A
//! subscription names a *filter*, which may use two wildcards:
//!
//! - `+` matches exactly one level (`sensors/+/temp`)
//! - `#` matches the remaining levels, including zero of them, and is only
//!   legal as the last level (`sensors/#` matches `sensors` too)
//!
//! [`Topic`] is a thin newtype over the raw string; [`TopicFilter`] is the
//! parsed level list. Matching is pure and allocation-free.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A concrete (wildcard-free) topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate the slash-separated levels of the topic.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Build a topic from its levels.
    pub fn from_levels<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = levels
            .into_iter()
            .map(|l| l.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One level of a parsed topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterLevel {
    /// A literal token that must match the topic level exactly.
    Literal(String),
    /// `+`: matches any single level.
    Plus,
    /// `#`: matches all remaining levels (terminal only).
    Hash,
}

/// A parsed MQTT topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicFilter {
    levels: Vec<FilterLevel>,
}

impl TopicFilter {
    /// Parse and validate a filter string.
    ///
    /// Rejects empty filters, `#` anywhere but the last level, and tokens
    /// that mix a wildcard character with other text (`foo+` is invalid).
    pub fn parse(filter: &str) -> Result<Self> {
        if filter.is_empty() {
            return Err(Error::EmptyTopicFilter);
        }
        let raw: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(raw.len());
        for (i, token) in raw.iter().enumerate() {
            let level = match *token {
                "+" => FilterLevel::Plus,
                "#" => {
                    if i != raw.len() - 1 {
                        return Err(Error::InvalidTopicFilter(format!(
                            "'#' must be the last level: {filter}"
                        )));
                    }
                    FilterLevel::Hash
                }
                t if t.contains('+') || t.contains('#') => {
                    return Err(Error::InvalidTopicFilter(format!(
                        "wildcard must be a whole level: {filter}"
                    )));
                }
                t => FilterLevel::Literal(t.to_string()),
            };
            levels.push(level);
        }
        Ok(Self { levels })
    }

    /// Build a filter directly from levels. Validates the `#` placement.
    pub fn from_levels(levels: Vec<FilterLevel>) -> Result<Self> {
        if levels.is_empty() {
            return Err(Error::EmptyTopicFilter);
        }
        if let Some(pos) = levels.iter().position(|l| *l == FilterLevel::Hash) {
            if pos != levels.len() - 1 {
                return Err(Error::InvalidTopicFilter(
                    "'#' must be the last level".to_string(),
                ));
            }
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[FilterLevel] {
        &self.levels
    }

    /// True if the filter contains no wildcards at all.
    pub fn is_concrete(&self) -> bool {
        self.levels
            .iter()
            .all(|l| matches!(l, FilterLevel::Literal(_)))
    }

    /// MQTT wildcard matching against a concrete topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        let tokens: Vec<&str> = topic.levels().collect();
        matches_levels(&tokens, &self.levels)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match level {
                FilterLevel::Literal(t) => f.write_str(t)?,
                FilterLevel::Plus => f.write_str("+")?,
                FilterLevel::Hash => f.write_str("#")?,
            }
        }
        Ok(())
    }
}

fn matches_levels(topic: &[&str], filter: &[FilterLevel]) -> bool {
    match (filter.first(), topic.first()) {
        (None, None) => true,
        // '#' swallows the rest of the topic, including zero levels.
        (Some(FilterLevel::Hash), _) => true,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some(FilterLevel::Plus), Some(_)) => matches_levels(&topic[1..], &filter[1..]),
        (Some(FilterLevel::Literal(l)), Some(t)) => {
            l == t && matches_levels(&topic[1..], &filter[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Topic basics
    // ---------------------------------------------------------------

    #[test]
    fn test_topic_levels() {
        let topic = Topic::new("sensors/floor1/temp");
        let levels: Vec<&str> = topic.levels().collect();
        assert_eq!(levels, vec!["sensors", "floor1", "temp"]);
    }

    #[test]
    fn test_topic_single_level() {
        let topic = Topic::new("sensors");
        assert_eq!(topic.levels().count(), 1);
    }

    #[test]
    fn test_topic_from_levels_roundtrip() {
        let topic = Topic::from_levels(["a", "b", "c"]);
        assert_eq!(topic.as_str(), "a/b/c");
    }

    #[test]
    fn test_topic_display() {
        let topic = Topic::new("t/1");
        assert_eq!(topic.to_string(), "t/1");
    }

    // ---------------------------------------------------------------
    // Filter parsing
    // ---------------------------------------------------------------

    #[test]
    fn test_parse_literal_filter() {
        let filter = TopicFilter::parse("a/b/c").unwrap();
        assert_eq!(filter.levels().len(), 3);
        assert!(filter.is_concrete());
    }

    #[test]
    fn test_parse_plus_filter() {
        let filter = TopicFilter::parse("a/+/c").unwrap();
        assert_eq!(filter.levels()[1], FilterLevel::Plus);
        assert!(!filter.is_concrete());
    }

    #[test]
    fn test_parse_hash_filter() {
        let filter = TopicFilter::parse("a/#").unwrap();
        assert_eq!(filter.levels()[1], FilterLevel::Hash);
    }

    #[test]
    fn test_parse_bare_hash() {
        let filter = TopicFilter::parse("#").unwrap();
        assert_eq!(filter.levels(), &[FilterLevel::Hash]);
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(TopicFilter::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_inner_hash() {
        assert!(TopicFilter::parse("a/#/b").is_err());
    }

    #[test]
    fn test_parse_rejects_mixed_wildcard_token() {
        assert!(TopicFilter::parse("a/b+").is_err());
        assert!(TopicFilter::parse("a#/b").is_err());
    }

    #[test]
    fn test_from_levels_rejects_inner_hash() {
        let levels = vec![FilterLevel::Hash, FilterLevel::Plus];
        assert!(TopicFilter::from_levels(levels).is_err());
    }

    #[test]
    fn test_filter_display_roundtrip() {
        for raw in ["a/b/c", "a/+/c", "a/#", "#", "+/+"] {
            let filter = TopicFilter::parse(raw).unwrap();
            assert_eq!(filter.to_string(), raw);
        }
    }

    // ---------------------------------------------------------------
    // Matching
    // ---------------------------------------------------------------

    #[test]
    fn test_match_exact() {
        let filter = TopicFilter::parse("a/b/c").unwrap();
        assert!(filter.matches(&Topic::new("a/b/c")));
        assert!(!filter.matches(&Topic::new("a/b")));
        assert!(!filter.matches(&Topic::new("a/b/c/d")));
        assert!(!filter.matches(&Topic::new("a/b/x")));
    }

    #[test]
    fn test_match_plus_single_level() {
        let filter = TopicFilter::parse("a/+/c").unwrap();
        assert!(filter.matches(&Topic::new("a/b/c")));
        assert!(filter.matches(&Topic::new("a/x/c")));
        assert!(!filter.matches(&Topic::new("a/c")));
        assert!(!filter.matches(&Topic::new("a/b/x/c")));
    }

    #[test]
    fn test_match_plus_plus() {
        let filter = TopicFilter::parse("+/+").unwrap();
        assert!(filter.matches(&Topic::new("foo/bar")));
        assert!(!filter.matches(&Topic::new("foo")));
        assert!(!filter.matches(&Topic::new("foo/bar/baz")));
    }

    #[test]
    fn test_match_hash_swallows_rest() {
        let filter = TopicFilter::parse("a/#").unwrap();
        assert!(filter.matches(&Topic::new("a/b/c")));
        assert!(filter.matches(&Topic::new("a/b")));
        // '#' also matches the parent level itself
        assert!(filter.matches(&Topic::new("a")));
        assert!(!filter.matches(&Topic::new("x/b")));
    }

    #[test]
    fn test_match_bare_hash_matches_everything() {
        let filter = TopicFilter::parse("#").unwrap();
        assert!(filter.matches(&Topic::new("a")));
        assert!(filter.matches(&Topic::new("a/b/c/d")));
    }

    #[test]
    fn test_match_empty_levels_are_significant() {
        // "a//b" has an empty middle level; '+' matches it, a literal does not
        let plus = TopicFilter::parse("a/+/b").unwrap();
        assert!(plus.matches(&Topic::new("a//b")));
        let lit = TopicFilter::parse("a/x/b").unwrap();
        assert!(!lit.matches(&Topic::new("a//b")));
    }
}
