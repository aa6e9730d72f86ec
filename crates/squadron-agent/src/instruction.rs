//! Assembles the prompt handed to `send_and_wait` on every turn: the
//! role's interpolated base prompt, any message injected by the caller
//! (a wake reason, a resume notice), the drained mail queue, and whatever
//! short inbox lines are pending. All backends go through this so the
//! prompt shape stays identical regardless of which LLM runtime is behind
//! [`crate::claude::ClaudeBackend`].

use squadron_core::agent_manager::PromptBuilder;
use squadron_core::config::RoleConfig;
use squadron_core::types::{MailMessage, MessageProvenance};

pub struct RolePromptBuilder;

impl PromptBuilder for RolePromptBuilder {
    fn build(
        &self,
        role: &RoleConfig,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
        mail: &[MailMessage],
        inbox_lines: &[String],
        injected: Option<String>,
    ) -> String {
        let mut s = interpolate(&role.prompt, issue_number, pr_number);

        if let Some(injected) = injected.filter(|m| !m.is_empty()) {
            s.push_str("\n\n---\n\n");
            s.push_str(&injected);
        }

        if !mail.is_empty() {
            s.push_str("\n\n---\n\nInbound Messages:\n");
            for message in mail {
                s.push_str(&format!(
                    "\n@{} ({}, {}):\n{}\n",
                    message.sender,
                    provenance_label(message.provenance),
                    message.received_at.to_rfc3339(),
                    message.body,
                ));
            }
        }

        if !inbox_lines.is_empty() {
            s.push_str("\n\n---\n\nEvents:\n");
            for line in inbox_lines {
                s.push_str(&format!("- {line}\n"));
            }
        }

        s
    }
}

fn provenance_label(provenance: MessageProvenance) -> &'static str {
    match provenance {
        MessageProvenance::IssueComment => "issue_comment",
        MessageProvenance::PrComment => "pr_comment",
    }
}

/// Substitutes `{issue_number}`/`{pr_number}` in a role's base prompt.
/// Both are empty strings when absent rather than the literal `"None"`.
fn interpolate(template: &str, issue_number: Option<i64>, pr_number: Option<i64>) -> String {
    template
        .replace("{issue_number}", &issue_number.map(|n| n.to_string()).unwrap_or_default())
        .replace("{pr_number}", &pr_number.map(|n| n.to_string()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use squadron_core::config::RoleConfig;

    fn role(prompt: &str) -> RoleConfig {
        RoleConfig {
            name: "implementer".to_string(),
            model: None,
            allowed_tools: None,
            wake_on_labels: vec![],
            singleton: false,
            triggers: vec![],
            circuit_breaker: None,
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn interpolates_issue_and_pr_numbers() {
        let out = interpolate("issue #{issue_number}, pr #{pr_number}", Some(7), None);
        assert_eq!(out, "issue #7, pr #");
    }

    #[test]
    fn appends_mail_and_inbox_sections() {
        let builder = RolePromptBuilder;
        let mail = vec![MailMessage {
            sender: "octocat".to_string(),
            body: "please add tests".to_string(),
            provenance: MessageProvenance::IssueComment,
            received_at: chrono::Utc::now(),
        }];
        let inbox = vec!["blocker #12 resolved".to_string()];
        let prompt = builder.build(&role("You are the implementer for #{issue_number}."), Some(12), None, &mail, &inbox, None);
        assert!(prompt.contains("You are the implementer for #12."));
        assert!(prompt.contains("Inbound Messages"));
        assert!(prompt.contains("@octocat"));
        assert!(prompt.contains("please add tests"));
        assert!(prompt.contains("Events:"));
        assert!(prompt.contains("blocker #12 resolved"));
    }
}
