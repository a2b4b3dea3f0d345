//! Session allow-rule building and matching
//!
//! Rules have the form `Name` or `Name(content)`. Content ending in `:*`
//! matches by the first whitespace token of the input's `command`, for any
//! tool. Other content matches only `Bash`, by exact command equality.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// `Name(content)`
static RULE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^(]+)\(([^)]+)\)$").expect("Invalid regex"));

const BASH_TOOL: &str = "Bash";
const PREFIX_SUFFIX: &str = ":*";

/// A parsed session allow-rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    /// The tool name (e.g., "Bash", "Edit")
    pub tool_name: String,
    /// The content inside the parentheses (e.g., "npm:*")
    pub content: Option<String>,
}

impl ParsedRule {
    /// Parse a rule string like "Edit", "Bash(npm:*)", "Bash(git status)"
    pub fn parse(rule: &str) -> Self {
        if let Some(caps) = RULE_PATTERN.captures(rule) {
            let tool_name = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let content = caps.get(2).map(|m| m.as_str().to_string());
            return Self { tool_name, content };
        }

        // Not parenthesised: the whole rule is a tool name
        Self {
            tool_name: rule.to_string(),
            content: None,
        }
    }

    /// Check if this rule matches a tool invocation
    pub fn matches(&self, tool_name: &str, input: &Value) -> bool {
        if self.tool_name != tool_name {
            return false;
        }

        let Some(ref content) = self.content else {
            return true;
        };

        let Some(command) = input.get("command").and_then(Value::as_str) else {
            return false;
        };

        match content.strip_suffix(PREFIX_SUFFIX) {
            Some(prefix) => first_token(command) == Some(prefix),
            None => tool_name == BASH_TOOL && command == content,
        }
    }
}

fn first_token(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

/// Build the rule that `approveAlways` records for a tool call
///
/// `Bash` calls produce a prefix rule from the first token of the command
/// (`Bash(npm:*)`); anything else produces the bare tool name.
pub fn build_session_rule(tool_name: &str, input: &Value) -> String {
    if tool_name == BASH_TOOL {
        if let Some(token) = input
            .get("command")
            .and_then(Value::as_str)
            .and_then(first_token)
        {
            return format!("{BASH_TOOL}({token}{PREFIX_SUFFIX})");
        }
    }
    tool_name.to_string()
}

/// Check whether any rule allows a tool invocation
pub fn matches_session_rule<'a, I>(tool_name: &str, input: &Value, rules: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    first_matching_rule(tool_name, input, rules).is_some()
}

/// First rule, in iteration order, that allows a tool invocation
pub fn first_matching_rule<'a, I>(tool_name: &str, input: &Value, rules: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    rules
        .into_iter()
        .find(|rule| ParsedRule::parse(rule).matches(tool_name, input))
}

/// Insertion-ordered set of allow-rules scoped to one session
#[derive(Debug, Clone, Default)]
pub struct SessionRules {
    rules: Vec<String>,
}

impl SessionRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; returns false if it was already present
    pub fn add(&mut self, rule: impl Into<String>) -> bool {
        let rule = rule.into();
        if self.rules.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// Add the rule built for this tool call and return it
    pub fn allow_always(&mut self, tool_name: &str, input: &Value) -> String {
        let rule = build_session_rule(tool_name, input);
        self.add(rule.clone());
        rule
    }

    /// First rule in insertion order matching the invocation
    pub fn find_match(&self, tool_name: &str, input: &Value) -> Option<&str> {
        first_matching_rule(tool_name, input, self.iter())
    }

    pub fn matches(&self, tool_name: &str, input: &Value) -> bool {
        self.find_match(tool_name, input).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_rule() {
        let rule = ParsedRule::parse("Edit");
        assert_eq!(rule.tool_name, "Edit");
        assert!(rule.content.is_none());
    }

    #[test]
    fn test_parse_rule_with_content() {
        let rule = ParsedRule::parse("Bash(npm:*)");
        assert_eq!(rule.tool_name, "Bash");
        assert_eq!(rule.content.as_deref(), Some("npm:*"));
    }

    #[test]
    fn test_parse_malformed_rule_is_bare_name() {
        let rule = ParsedRule::parse("Bash(unclosed");
        assert_eq!(rule.tool_name, "Bash(unclosed");
        assert!(rule.content.is_none());
    }

    #[test]
    fn test_build_bash_rule() {
        assert_eq!(
            build_session_rule("Bash", &json!({"command": "npm install x"})),
            "Bash(npm:*)"
        );
        assert_eq!(
            build_session_rule("Bash", &json!({"command": "  git   status"})),
            "Bash(git:*)"
        );
    }

    #[test]
    fn test_build_non_bash_rule() {
        assert_eq!(
            build_session_rule("Edit", &json!({"file_path": "/tmp/a"})),
            "Edit"
        );
        // Bash without a command falls back to the bare name
        assert_eq!(build_session_rule("Bash", &json!({})), "Bash");
    }

    #[test]
    fn test_bare_rule_matches_any_input() {
        let rules = ["Edit"];
        assert!(matches_session_rule("Edit", &json!({"file_path": "/a"}), rules));
        assert!(!matches_session_rule("Write", &json!({}), rules));
    }

    #[test]
    fn test_bash_prefix_rule() {
        let rules = ["Bash(npm:*)"];
        assert!(matches_session_rule("Bash", &json!({"command": "npm test"}), rules));
        assert!(matches_session_rule("Bash", &json!({"command": "npm"}), rules));
        assert!(!matches_session_rule("Bash", &json!({"command": "npx jest"}), rules));
        assert!(!matches_session_rule("Bash", &json!({"command": "pnpm i"}), rules));
        assert!(!matches_session_rule("Bash", &json!({}), rules));
    }

    #[test]
    fn test_bash_exact_rule() {
        let rules = ["Bash(git status)"];
        assert!(matches_session_rule("Bash", &json!({"command": "git status"}), rules));
        assert!(!matches_session_rule(
            "Bash",
            &json!({"command": "git status --short"}),
            rules
        ));
    }

    #[test]
    fn test_prefix_rule_applies_to_any_tool() {
        let rules = ["Edit(src:*)"];
        assert!(matches_session_rule("Edit", &json!({"command": "src x"}), rules));
        assert!(!matches_session_rule("Edit", &json!({"command": "lib x"}), rules));
        assert!(!matches_session_rule("Edit", &json!({"file_path": "src"}), rules));
        assert!(!matches_session_rule("Write", &json!({"command": "src x"}), rules));
    }

    #[test]
    fn test_exact_rule_only_applies_to_bash() {
        let rules = ["Edit(src x)"];
        assert!(!matches_session_rule("Edit", &json!({"command": "src x"}), rules));
    }

    #[test]
    fn test_session_rules_dedup_and_order() {
        let mut rules = SessionRules::new();
        assert!(rules.add("Bash(git:*)"));
        assert!(rules.add("Bash(git status)"));
        assert!(!rules.add("Bash(git:*)"));
        assert_eq!(rules.len(), 2);

        // Both match; the first inserted wins
        let input = json!({"command": "git status"});
        assert_eq!(rules.find_match("Bash", &input), Some("Bash(git:*)"));
    }

    #[test]
    fn test_allow_always_records_built_rule() {
        let mut rules = SessionRules::new();
        let rule = rules.allow_always("Bash", &json!({"command": "cargo build"}));
        assert_eq!(rule, "Bash(cargo:*)");
        assert!(rules.matches("Bash", &json!({"command": "cargo test"})));
        assert!(!rules.matches("Edit", &json!({})));
    }
}
