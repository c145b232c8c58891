//! Match criteria evaluated against candidate items.
//!
//! Rules of one watch target are OR-combined. Evaluation is pure: it only
//! reads the item and the rule, so results never depend on call order.

use crate::types::CandidateItem;
use regex::Regex;

/// Which text of an item a keyword rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    Title,
    Body,
    #[default]
    Any,
}

#[derive(Debug, Clone)]
pub enum MatchRule {
    /// Case-insensitive substring. The needle is stored lowercased.
    KeywordContains { needle: String, field: TextField },
    /// Case-insensitive flair comparison.
    FlairEquals(String),
    /// Inclusive score threshold.
    ScoreAtLeast(i64),
    /// Case-insensitive author comparison, without the `u/` prefix.
    AuthorEquals(String),
    /// Compiled case-insensitive regex against title and body.
    PatternMatch(Regex),
    /// Text (self) posts only.
    SelfPost,
    /// Every nested rule must match. Never empty once validated.
    All(Vec<MatchRule>),
}

impl MatchRule {
    pub fn keyword(needle: &str, field: TextField) -> Self {
        MatchRule::KeywordContains {
            needle: needle.to_lowercase(),
            field,
        }
    }

    pub fn author(name: &str) -> Self {
        let name = name.trim();
        let name = name
            .strip_prefix("/u/")
            .or_else(|| name.strip_prefix("u/"))
            .unwrap_or(name);
        MatchRule::AuthorEquals(name.to_string())
    }

    pub fn matches(&self, item: &CandidateItem) -> bool {
        match self {
            MatchRule::KeywordContains { needle, field } => {
                let haystack = match field {
                    TextField::Title => item.title.to_lowercase(),
                    TextField::Body => item.body.to_lowercase(),
                    TextField::Any => item.searchable_text().to_lowercase(),
                };
                haystack.contains(needle.as_str())
            }
            MatchRule::FlairEquals(flair) => item
                .flair
                .as_deref()
                .map(|f| f.trim().eq_ignore_ascii_case(flair.trim()))
                .unwrap_or(false),
            MatchRule::ScoreAtLeast(threshold) => item.score >= *threshold,
            MatchRule::AuthorEquals(author) => item.author.eq_ignore_ascii_case(author),
            MatchRule::PatternMatch(pattern) => pattern.is_match(&item.searchable_text()),
            MatchRule::SelfPost => item.is_self,
            // An empty group is rejected at load time; treat it as no match
            // rather than vacuous truth.
            MatchRule::All(rules) => !rules.is_empty() && rules.iter().all(|r| r.matches(item)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            MatchRule::KeywordContains { needle, field } => {
                format!("keyword {:?} in {:?}", needle, field)
            }
            MatchRule::FlairEquals(flair) => format!("flair = {:?}", flair),
            MatchRule::ScoreAtLeast(threshold) => format!("score >= {}", threshold),
            MatchRule::AuthorEquals(author) => format!("author = u/{}", author),
            MatchRule::PatternMatch(pattern) => format!("pattern /{}/", pattern.as_str()),
            MatchRule::SelfPost => "self post".to_string(),
            MatchRule::All(rules) => format!(
                "all({})",
                rules
                    .iter()
                    .map(MatchRule::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// True when any rule matches. An empty rule list matches nothing.
pub fn matches(item: &CandidateItem, rules: &[MatchRule]) -> bool {
    rules.iter().any(|rule| rule.matches(item))
}

/// First rule that matched, for logging.
pub fn first_match<'a>(item: &CandidateItem, rules: &'a [MatchRule]) -> Option<&'a MatchRule> {
    rules.iter().find(|rule| rule.matches(item))
}
