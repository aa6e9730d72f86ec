//! Parses issue/PR comment bodies for slash-commands and bot mentions.
//!
//! Two forms are recognised:
//!   `/squadron status`                  — a built-in action, no agent routing
//!   `/squadron reviewer: please re-check` — routes to the `reviewer` role
//!   `@squadron-dev implementer: fix the typo` — mention form, same routing
//!
//! Code spans (fenced ``` blocks and inline `code`) are stripped before
//! matching so a command-looking string quoted inside a code block is never
//! mistaken for a live command.

use regex::Regex;

pub const BOT_MENTION: &str = "squadron-dev";

const BUILT_IN_ACTIONS: &[&str] = &["status", "cancel", "retry", "list", "help"];

fn strip_code_spans(text: &str) -> String {
    let fenced = Regex::new(r"```[\s\S]*?```").expect("valid regex");
    let without_fenced = fenced.replace_all(text, " ");
    let inline = Regex::new(r"`[^`\n]*`").expect("valid regex");
    inline.replace_all(&without_fenced, " ").into_owned()
}

/// Compiled, config-driven command grammar. Rebuilt whenever the project
/// config's `commands` section changes (prefix, known agent roles, known
/// built-in actions).
pub struct CommandParser {
    prefix: String,
    known_agents: Vec<String>,
    command_re: Regex,
    help_re: Regex,
    mention_re: Regex,
}

impl CommandParser {
    pub fn new(prefix: &str, known_agents: &[String]) -> Self {
        let escaped_prefix = regex::escape(prefix);
        let command_re = Regex::new(&format!(
            r"(?m)^\s*{escaped_prefix}\s+(\w+)(?::)?(?:\s+(.*))?\s*$"
        ))
        .expect("valid regex");
        let help_re = Regex::new(&format!(r"(?mi)^\s*{escaped_prefix}\s+help\s*$")).expect("valid regex");
        let mention_re = Regex::new(&format!(
            r"(?m)@{}\s+(\w+):\s*(.*)",
            regex::escape(BOT_MENTION)
        ))
        .expect("valid regex");
        Self {
            prefix: prefix.to_string(),
            known_agents: known_agents.to_vec(),
            command_re,
            help_re,
            mention_re,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Parses a single comment body. Returns `None` if no command or
    /// mention pattern matched.
    pub fn parse(&self, body: &str) -> Option<super::types::ParsedCommand> {
        let cleaned = strip_code_spans(body);

        if self.help_re.is_match(&cleaned) {
            return Some(super::types::ParsedCommand {
                action_name: Some("help".to_string()),
                agent_name: None,
                message: None,
                mentioned_roles: Vec::new(),
            });
        }

        if let Some(caps) = self.command_re.captures(&cleaned) {
            let word = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let rest = caps.get(2).map(|m| m.as_str().trim().to_string());
            return Some(self.route(word, rest, &cleaned));
        }

        if let Some(caps) = self.mention_re.captures(&cleaned) {
            let word = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let rest = caps.get(2).map(|m| m.as_str().trim().to_string());
            return Some(self.route(word, rest, &cleaned));
        }

        None
    }

    fn route(&self, word: String, message: Option<String>, full_text: &str) -> super::types::ParsedCommand {
        let mentioned_roles = self.extract_mentioned_roles(full_text);
        let is_known_agent = self.known_agents.iter().any(|a| a == &word);
        let is_builtin = BUILT_IN_ACTIONS.contains(&word.as_str());

        if is_known_agent && !is_builtin {
            super::types::ParsedCommand {
                action_name: None,
                agent_name: Some(word),
                message,
                mentioned_roles,
            }
        } else {
            super::types::ParsedCommand {
                action_name: Some(word),
                agent_name: None,
                message,
                mentioned_roles,
            }
        }
    }

    /// All `@role` style mentions anywhere in the body, used to wake
    /// multiple sleeping agents at once from one comment.
    fn extract_mentioned_roles(&self, text: &str) -> Vec<String> {
        self.known_agents
            .iter()
            .filter(|role| text.contains(role.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> CommandParser {
        CommandParser::new("/squadron", &["reviewer".into(), "implementer".into()])
    }

    #[test]
    fn parses_builtin_action() {
        let p = parser();
        let parsed = p.parse("/squadron status").unwrap();
        assert_eq!(parsed.action_name.as_deref(), Some("status"));
        assert!(parsed.is_action());
    }

    #[test]
    fn parses_agent_routed_command() {
        let p = parser();
        let parsed = p.parse("/squadron reviewer: please re-check the diff").unwrap();
        assert_eq!(parsed.agent_name.as_deref(), Some("reviewer"));
        assert_eq!(parsed.message.as_deref(), Some("please re-check the diff"));
    }

    #[test]
    fn parses_mention_form() {
        let p = parser();
        let parsed = p.parse("@squadron-dev implementer: fix the typo").unwrap();
        assert_eq!(parsed.agent_name.as_deref(), Some("implementer"));
    }

    #[test]
    fn ignores_commands_inside_code_fences() {
        let p = parser();
        let body = "```\n/squadron status\n```\njust a normal comment";
        assert!(p.parse(body).is_none());
    }

    #[test]
    fn ignores_inline_code_commands() {
        let p = parser();
        let body = "run `/squadron status` to check";
        assert!(p.parse(body).is_none());
    }
}
