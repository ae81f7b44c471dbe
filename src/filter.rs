//! Per-source inclusion/exclusion rules.
//!
//! Evaluation policy:
//!
//! - Any matching exclude rule rejects the item; the reason names that rule.
//! - Otherwise, when include rules exist, at least one must match.
//! - With no include rules and no exclude match, the item is admitted.
//!
//! Rules are compiled once into a [`RuleSet`] when a source snapshot is built,
//! so evaluation never compiles regexes.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reason recorded when include rules exist but none matched.
pub const NO_INCLUDE_MATCHED: &str = "no include rule matched";

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid pattern {pattern:?} for {field} rule: {source}")]
    InvalidPattern {
        field: Field,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Empty pattern for {0} rule")]
    EmptyPattern(Field),
}

// ============================================================================
// Rule Definitions
// ============================================================================

/// Item field a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Description,
    Content,
    Author,
    Category,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Title => "title",
            Field::Description => "description",
            Field::Content => "content",
            Field::Author => "author",
            Field::Category => "category",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Substring,
    #[serde(alias = "regex")]
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Include,
    Exclude,
}

/// One configured rule, as written in the sources file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: Field,
    #[serde(default)]
    pub mode: MatchMode,
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
    pub action: Action,
}

// ============================================================================
// Item View
// ============================================================================

/// Borrowed view of the filterable fields of an item.
///
/// Both freshly parsed items and stored records produce one, so first-sight
/// filtering and re-filtering run the same code.
#[derive(Debug, Clone, Copy)]
pub struct ItemFields<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub content: Option<&'a str>,
    pub author_name: Option<&'a str>,
    pub author_email: Option<&'a str>,
    pub categories: &'a [String],
}

impl<'a> ItemFields<'a> {
    /// Text values of `field`. Missing fields yield nothing and never match.
    pub fn values(&self, field: Field) -> Vec<&'a str> {
        match field {
            Field::Title => self.title.into_iter().collect(),
            Field::Description => self.description.into_iter().collect(),
            Field::Content => self.content.into_iter().collect(),
            Field::Author => self
                .author_name
                .into_iter()
                .chain(self.author_email)
                .collect(),
            Field::Category => self.categories.iter().map(String::as_str).collect(),
        }
    }
}

// ============================================================================
// Compiled Rules
// ============================================================================

#[derive(Debug, Clone)]
enum Matcher {
    /// Needle is pre-lowercased when case-insensitive
    Substring { needle: String, case_sensitive: bool },
    Pattern(Regex),
}

impl Matcher {
    fn is_match(&self, haystack: &str) -> bool {
        match self {
            Matcher::Substring {
                needle,
                case_sensitive: true,
            } => haystack.contains(needle.as_str()),
            Matcher::Substring {
                needle,
                case_sensitive: false,
            } => haystack.to_lowercase().contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(haystack),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    field: Field,
    pattern: String,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Result<Self, FilterError> {
        if rule.pattern.is_empty() {
            return Err(FilterError::EmptyPattern(rule.field));
        }

        let matcher = match rule.mode {
            MatchMode::Substring => Matcher::Substring {
                needle: if rule.case_sensitive {
                    rule.pattern.clone()
                } else {
                    rule.pattern.to_lowercase()
                },
                case_sensitive: rule.case_sensitive,
            },
            MatchMode::Pattern => {
                let re = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(!rule.case_sensitive)
                    .build()
                    .map_err(|source| FilterError::InvalidPattern {
                        field: rule.field,
                        pattern: rule.pattern.clone(),
                        source,
                    })?;
                Matcher::Pattern(re)
            }
        };

        Ok(Self {
            field: rule.field,
            pattern: rule.pattern.clone(),
            matcher,
        })
    }

    fn matches(&self, item: &ItemFields<'_>) -> bool {
        item.values(self.field)
            .into_iter()
            .any(|value| self.matcher.is_match(value))
    }
}

/// Decision for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub admitted: bool,
    /// Why the item was rejected; `None` for admitted items
    pub reason: Option<String>,
}

impl Verdict {
    fn admit() -> Self {
        Self {
            admitted: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            admitted: false,
            reason: Some(reason),
        }
    }

    /// Stored `filtered` flag
    pub fn filtered(&self) -> bool {
        !self.admitted
    }
}

/// A source's rules, partitioned by action and compiled.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    include: Vec<CompiledRule>,
    exclude: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[FilterRule]) -> Result<Self, FilterError> {
        let mut set = RuleSet::default();
        for rule in rules {
            let compiled = CompiledRule::compile(rule)?;
            match rule.action {
                Action::Include => set.include.push(compiled),
                Action::Exclude => set.exclude.push(compiled),
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn len(&self) -> usize {
        self.include.len() + self.exclude.len()
    }

    pub fn evaluate(&self, item: &ItemFields<'_>) -> Verdict {
        if let Some(rule) = self.exclude.iter().find(|r| r.matches(item)) {
            return Verdict::reject(format!(
                "excluded by {} rule {:?}",
                rule.field, rule.pattern
            ));
        }

        if !self.include.is_empty() && !self.include.iter().any(|r| r.matches(item)) {
            return Verdict::reject(NO_INCLUDE_MATCHED.to_string());
        }

        Verdict::admit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn rule(field: Field, mode: MatchMode, pattern: &str, action: Action) -> FilterRule {
        FilterRule {
            field,
            mode,
            pattern: pattern.to_string(),
            case_sensitive: false,
            action,
        }
    }

    fn titled(title: &str) -> ItemFields<'_> {
        ItemFields {
            title: Some(title),
            description: None,
            content: None,
            author_name: None,
            author_email: None,
            categories: &[],
        }
    }

    fn categorised(categories: &[String]) -> ItemFields<'_> {
        ItemFields {
            title: Some("Anything"),
            description: None,
            content: None,
            author_name: None,
            author_email: None,
            categories,
        }
    }

    #[test]
    fn test_empty_ruleset_admits_everything() {
        let rules = RuleSet::compile(&[]).unwrap();
        assert!(rules.is_empty());
        assert_eq!(rules.evaluate(&titled("Anything")), Verdict::admit());
    }

    #[test]
    fn test_exclude_title_substring() {
        let rules = RuleSet::compile(&[rule(
            Field::Title,
            MatchMode::Substring,
            "ad",
            Action::Exclude,
        )])
        .unwrap();

        let verdict = rules.evaluate(&titled("Ad: buy now"));
        assert!(!verdict.admitted);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("title"), "reason was {}", reason);
        assert!(reason.contains("ad"));

        assert!(rules.evaluate(&titled("Report")).admitted);
    }

    #[test]
    fn test_include_category_only() {
        let rules = RuleSet::compile(&[rule(
            Field::Category,
            MatchMode::Substring,
            "tech",
            Action::Include,
        )])
        .unwrap();

        let sports = vec!["sports".to_string()];
        let verdict = rules.evaluate(&categorised(&sports));
        assert!(!verdict.admitted);
        assert_eq!(verdict.reason.as_deref(), Some(NO_INCLUDE_MATCHED));

        let tech = vec!["tech".to_string(), "misc".to_string()];
        assert!(rules.evaluate(&categorised(&tech)).admitted);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let rules = RuleSet::compile(&[
            rule(Field::Title, MatchMode::Substring, "rust", Action::Include),
            rule(Field::Title, MatchMode::Substring, "sponsored", Action::Exclude),
        ])
        .unwrap();

        assert!(rules.evaluate(&titled("Rust 1.80 released")).admitted);
        assert!(!rules.evaluate(&titled("Sponsored: Rust jobs")).admitted);
        assert!(!rules.evaluate(&titled("Go news")).admitted);
    }

    #[test]
    fn test_case_sensitive_substring() {
        let mut exact = rule(Field::Title, MatchMode::Substring, "AD", Action::Exclude);
        exact.case_sensitive = true;
        let rules = RuleSet::compile(&[exact]).unwrap();

        assert!(!rules.evaluate(&titled("AD: sale")).admitted);
        assert!(rules.evaluate(&titled("Ad: sale")).admitted);
    }

    #[test]
    fn test_pattern_mode() {
        let rules = RuleSet::compile(&[rule(
            Field::Title,
            MatchMode::Pattern,
            r"^\[(ad|promo)\]",
            Action::Exclude,
        )])
        .unwrap();

        assert!(!rules.evaluate(&titled("[PROMO] Big sale")).admitted);
        assert!(rules.evaluate(&titled("Not a [promo]")).admitted);
    }

    #[test]
    fn test_case_sensitive_pattern() {
        let mut exact = rule(Field::Title, MatchMode::Pattern, "^Release", Action::Include);
        exact.case_sensitive = true;
        let rules = RuleSet::compile(&[exact]).unwrap();

        assert!(rules.evaluate(&titled("Release notes")).admitted);
        assert!(!rules.evaluate(&titled("release notes")).admitted);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RuleSet::compile(&[rule(
            Field::Content,
            MatchMode::Pattern,
            "(unclosed",
            Action::Exclude,
        )]);
        assert!(matches!(result, Err(FilterError::InvalidPattern { .. })));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let result = RuleSet::compile(&[rule(Field::Title, MatchMode::Substring, "", Action::Include)]);
        assert!(matches!(result, Err(FilterError::EmptyPattern(Field::Title))));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let rules = RuleSet::compile(&[rule(
            Field::Description,
            MatchMode::Substring,
            "x",
            Action::Include,
        )])
        .unwrap();
        // No description at all
        assert!(!rules.evaluate(&titled("xxx")).admitted);
    }

    #[test]
    fn test_author_matches_name_or_email() {
        let rules = RuleSet::compile(&[rule(
            Field::Author,
            MatchMode::Substring,
            "@spam.example",
            Action::Exclude,
        )])
        .unwrap();

        let item = ItemFields {
            title: Some("Hi"),
            description: None,
            content: None,
            author_name: Some("Totally Real"),
            author_email: Some("bot@spam.example"),
            categories: &[],
        };
        assert!(!rules.evaluate(&item).admitted);
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: FilterRule =
            toml::from_str("field = \"category\"\npattern = \"tech\"\naction = \"include\"\n")
                .unwrap();
        assert_eq!(rule.mode, MatchMode::Substring);
        assert!(!rule.case_sensitive);

        let rule: FilterRule = toml::from_str(
            "field = \"title\"\nmode = \"regex\"\npattern = \"x\"\naction = \"exclude\"\n",
        )
        .unwrap();
        assert_eq!(rule.mode, MatchMode::Pattern);
    }

    proptest! {
        #[test]
        fn prop_case_insensitive_substring_ignores_case(word in "[a-zA-Z]{1,12}", prefix in "[a-z ]{0,8}") {
            let rules = RuleSet::compile(&[rule(Field::Title, MatchMode::Substring, &word.to_lowercase(), Action::Exclude)]).unwrap();
            let title = format!("{}{}", prefix, word.to_uppercase());
            prop_assert!(!rules.evaluate(&titled(&title)).admitted);
        }

        #[test]
        fn prop_excluded_items_always_carry_reason(title in ".{0,40}") {
            let rules = RuleSet::compile(&[rule(Field::Title, MatchMode::Substring, "a", Action::Exclude)]).unwrap();
            let verdict = rules.evaluate(&titled(&title));
            prop_assert_eq!(verdict.admitted, verdict.reason.is_none());
        }
    }
}
