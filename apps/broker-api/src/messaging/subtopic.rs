//! Hierarchical subtopics with a configurable separator and `*` wildcard tokens.

use crate::error::BrokerError;

pub const SUBTOPIC_WILDCARD: &str = "*";
pub const DEFAULT_SEPARATOR: &str = ".";

/// A validated subtopic, e.g. `sports.*` with separator `.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtopic {
    value: String,
    separator: String,
    hierarchical: bool,
    has_wildcard: bool,
}

impl Subtopic {
    /// Parse and validate a subtopic string.
    ///
    /// The wildcard must occupy a whole token; a non-hierarchical subtopic may
    /// only contain it as its entire value.
    pub fn parse(value: &str, separator: &str) -> Result<Self, BrokerError> {
        if value.is_empty() {
            return Err(BrokerError::routing("subtopic must not be empty"));
        }
        let separator = if separator.is_empty() {
            DEFAULT_SEPARATOR
        } else {
            separator
        };
        let hierarchical = value.contains(separator);
        let mut has_wildcard = false;

        if hierarchical {
            for token in value.split(separator) {
                if token.contains(SUBTOPIC_WILDCARD) {
                    if token != SUBTOPIC_WILDCARD {
                        return Err(invalid(value));
                    }
                    has_wildcard = true;
                }
            }
        } else if value.contains(SUBTOPIC_WILDCARD) {
            if value != SUBTOPIC_WILDCARD {
                return Err(invalid(value));
            }
            has_wildcard = true;
        }

        Ok(Self {
            value: value.to_string(),
            separator: separator.to_string(),
            hierarchical,
            has_wildcard,
        })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn is_hierarchical(&self) -> bool {
        self.hierarchical
    }

    pub fn contains_wildcard(&self) -> bool {
        self.has_wildcard
    }

    /// Whether two subtopics match. Either side may carry wildcards.
    pub fn matches(&self, other: &Subtopic) -> bool {
        if !self.has_wildcard && !other.has_wildcard {
            return self.value == other.value;
        }
        if self.hierarchical && other.hierarchical && self.separator != other.separator {
            return false;
        }

        let ours: Vec<&str> = self.value.split(self.separator.as_str()).collect();
        let theirs: Vec<&str> = other.value.split(other.separator.as_str()).collect();

        for (a, b) in ours.iter().zip(theirs.iter()) {
            if *a != SUBTOPIC_WILDCARD && *b != SUBTOPIC_WILDCARD && a != b {
                return false;
            }
        }

        match ours.len().cmp(&theirs.len()) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => ours.last() == Some(&SUBTOPIC_WILDCARD),
            std::cmp::Ordering::Greater => theirs.last() == Some(&SUBTOPIC_WILDCARD),
        }
    }
}

fn invalid(value: &str) -> BrokerError {
    BrokerError::routing(format!(
        "subtopic '{value}' is invalid: the wildcard '*' must be an entire token"
    ))
}

impl std::fmt::Display for Subtopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn st(s: &str) -> Subtopic {
        Subtopic::parse(s, ".").unwrap()
    }

    #[test]
    fn wildcard_must_be_whole_token() {
        assert!(Subtopic::parse("sports.foot*", ".").is_err());
        assert!(Subtopic::parse("a*", ".").is_err());
        assert!(Subtopic::parse("", ".").is_err());
        assert!(st("*").contains_wildcard());
        assert!(st("sports.*").contains_wildcard());
        assert!(!st("sports.football").contains_wildcard());
    }

    #[test]
    fn trailing_wildcard_matches_child() {
        assert!(st("sports.*").matches(&st("sports.football")));
        assert!(!st("sports.*").matches(&st("finance.stocks")));
    }

    #[test]
    fn trailing_wildcard_matches_deeper_levels() {
        assert!(st("sports.*").matches(&st("sports.football.scores")));
        assert!(!st("sports.*.scores").matches(&st("sports.football")));
    }

    #[test]
    fn inner_wildcard_matches_single_token() {
        assert!(st("sports.*.scores").matches(&st("sports.tennis.scores")));
        assert!(!st("sports.*.scores").matches(&st("sports.tennis.news")));
    }

    #[test]
    fn plain_subtopics_compare_exactly() {
        assert!(st("news").matches(&st("news")));
        assert!(!st("news").matches(&st("news.local")));
        assert!(st("*").matches(&st("anything")));
    }

    #[test]
    fn different_separators_never_match() {
        let slash = Subtopic::parse("sports/*", "/").unwrap();
        let dot = st("sports.*");
        assert!(!slash.matches(&dot));
    }
}
