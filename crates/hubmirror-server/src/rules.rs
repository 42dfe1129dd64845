//! Ordered allow/deny rules over `org/repo` names.
//!
//! Two independent lists gate every request: `proxy` (may this repository
//! be served at all) and `cache` (may its bytes be persisted). Every rule
//! is evaluated in order and the last match wins; a name no rule matches
//! is denied.

use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RuleConfig {
    pub repo: String,
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub use_re: bool,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    allow: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let pattern = if config.use_re {
                // Match-at-start semantics; the pattern may constrain the
                // end itself with `$`.
                Regex::new(&format!("^(?:{})", config.repo))?
            } else {
                Regex::new(&glob_to_regex(&config.repo))?
            };
            rules.push(Rule {
                pattern,
                allow: config.allow,
            });
        }
        Ok(Self { rules })
    }

    /// Allow-all, the default when no rules are configured.
    pub fn allow_all() -> Self {
        Self::from_configs(&[
            RuleConfig {
                repo: "*".to_string(),
                allow: true,
                use_re: false,
            },
            RuleConfig {
                repo: "*/*".to_string(),
                allow: true,
                use_re: false,
            },
        ])
        .unwrap_or_default()
    }

    pub fn allow(&self, org_repo: &str) -> bool {
        let mut allow = false;
        for rule in &self.rules {
            if rule.pattern.is_match(org_repo) {
                allow = rule.allow;
            }
        }
        allow
    }
}

/// Translates a glob pattern to an anchored regex. `*` matches any run of
/// characters (slashes included), `?` any single character, `[seq]` /
/// `[!seq]` character classes; everything else is literal.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("^(?:");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push(']');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        class.push('\\');
                    }
                    class.push(c);
                }
                if closed {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    // Unterminated class: treat the bracket literally.
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(&class.replace('^', "!")));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push_str(")$");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(repo: &str, allow: bool, use_re: bool) -> RuleConfig {
        RuleConfig {
            repo: repo.to_string(),
            allow,
            use_re,
        }
    }

    #[test]
    fn unmatched_names_are_denied() {
        let rules = RuleList::from_configs(&[rule("openai/*", true, false)]).unwrap();
        assert!(!rules.allow("meta/llama"));
        assert!(rules.allow("openai/gpt2"));
        assert!(!rules.allow("gpt2"));
    }

    #[test]
    fn last_matching_rule_wins() {
        let rules = RuleList::from_configs(&[
            rule("*", true, false),
            rule("*/*", true, false),
            rule("secret/*", false, false),
            rule("secret/public-model", true, false),
        ])
        .unwrap();
        assert!(rules.allow("openai/gpt2"));
        assert!(!rules.allow("secret/weights"));
        assert!(rules.allow("secret/public-model"));
    }

    #[test]
    fn globs_cross_slashes_like_fnmatch() {
        let rules = RuleList::from_configs(&[rule("*", true, false)]).unwrap();
        // A single `*` matches org/repo names too, matching the original
        // default rule behavior.
        assert!(rules.allow("openai/gpt2"));
    }

    #[test]
    fn glob_classes_and_question_marks() {
        let rules = RuleList::from_configs(&[rule("org/model-v[12]", true, false)]).unwrap();
        assert!(rules.allow("org/model-v1"));
        assert!(rules.allow("org/model-v2"));
        assert!(!rules.allow("org/model-v3"));

        let rules = RuleList::from_configs(&[rule("org/mode?", true, false)]).unwrap();
        assert!(rules.allow("org/model"));
        assert!(!rules.allow("org/modelx"));
    }

    #[test]
    fn regex_rules_anchor_at_start_only() {
        let rules = RuleList::from_configs(&[rule("openai/.*", true, true)]).unwrap();
        assert!(rules.allow("openai/gpt2"));
        assert!(!rules.allow("not-openai/gpt2"));

        // Prefix match, like Python's re.match.
        let rules = RuleList::from_configs(&[rule("open", true, true)]).unwrap();
        assert!(rules.allow("openai/gpt2"));
    }

    #[test]
    fn bad_regex_is_rejected_at_load() {
        assert!(RuleList::from_configs(&[rule("(", true, true)]).is_err());
    }

    #[test]
    fn allow_all_admits_both_name_shapes() {
        let rules = RuleList::allow_all();
        assert!(rules.allow("gpt2"));
        assert!(rules.allow("openai/gpt2"));
    }
}
