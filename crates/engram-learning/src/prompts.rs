//! Prompt rendering for the extraction LLM calls
//!
//! Window transcripts are rendered newest-last and trimmed oldest-first
//! against the prompt token budget before dispatch.

use engram_core::llm::{estimate_tokens, DEFAULT_PROMPT_TOKEN_BUDGET};
use engram_core::{Profile, RawFeedback, Window};
use engram_types::{
    AgentFeedbackConfig, AgentSuccessConfig, ProfileExtractorConfig, TenantConfig,
};

/// Render one window as a role-tagged transcript within the token budget
pub fn render_transcript(window: &Window, budget_tokens: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    for item in &window.items {
        let interaction = &item.interaction;
        let mut line = format!("[{}] {}", interaction.role.as_str(), interaction.content);
        if let Some(shadow) = &interaction.shadow_content {
            line.push_str(&format!("\n[Agent (shadow)] {shadow}"));
        }
        if let Some(description) = &interaction.user_action_description {
            line.push_str(&format!(
                "\n(user action {}: {description})",
                interaction.user_action.as_str()
            ));
        }
        for tool in &interaction.tools_used {
            line.push_str(&format!("\n(tool {}: {})", tool.name, tool.input));
        }
        lines.push(line);
    }

    // Drop oldest turns first until the transcript fits
    let mut start = 0;
    while start < lines.len().saturating_sub(1) {
        let total: usize = lines[start..].iter().map(|l| estimate_tokens(l)).sum();
        if total <= budget_tokens {
            break;
        }
        start += 1;
    }
    lines[start..].join("\n")
}

fn context_section(tenant: &TenantConfig) -> String {
    let mut section = String::new();
    if !tenant.agent_context_prompt.is_empty() {
        section.push_str(&format!("Agent context: {}\n\n", tenant.agent_context_prompt));
    }
    if !tenant.tool_can_use.is_empty() {
        section.push_str("Tools available to the agent:\n");
        for tool in &tenant.tool_can_use {
            section.push_str(&format!("- {}: {}\n", tool.tool_name, tool.tool_description));
        }
        section.push('\n');
    }
    section
}

/// The gate call deciding whether a window is worth extracting
pub fn profile_gate_prompt(
    gate_prompt: &str,
    tenant: &TenantConfig,
    window: &Window,
) -> String {
    format!(
        "{}{gate_prompt}\n\nConversation window:\n{}\n\nDecide whether this window contains \
         anything worth extracting.",
        context_section(tenant),
        render_transcript(window, DEFAULT_PROMPT_TOKEN_BUDGET),
    )
}

/// The profile delta extraction call
pub fn profile_extraction_prompt(
    config: &ProfileExtractorConfig,
    tenant: &TenantConfig,
    window: &Window,
    existing: &[Profile],
) -> String {
    let mut prompt = context_section(tenant);
    prompt.push_str(&format!(
        "You maintain a set of user profile facts.\n\
         Profile definition: {}\n",
        config.profile_content_definition_prompt
    ));
    if let Some(context) = &config.context_prompt {
        prompt.push_str(&format!("Additional context: {context}\n"));
    }
    if let Some(metadata) = &config.metadata_definition_prompt {
        prompt.push_str(&format!(
            "Populate custom_features according to: {metadata}\n"
        ));
    }

    prompt.push_str("\nCurrent profiles for this user:\n");
    if existing.is_empty() {
        prompt.push_str("(none)\n");
    } else {
        for profile in existing {
            prompt.push_str(&format!("- id={} content={}\n", profile.profile_id, profile.content));
        }
    }

    prompt.push_str(&format!(
        "\nConversation window:\n{}\n\n\
         Return a delta over the profile set. Use action \"add\" for new information, \
         \"replace\" (with profile_id and new content) for updated information, \"drop\" \
         (with profile_id) for stale information, and \"keep\" (with profile_id) for \
         profiles the window confirms unchanged. Do not restate unchanged profiles as adds.",
        render_transcript(window, DEFAULT_PROMPT_TOKEN_BUDGET),
    ));
    prompt
}

/// The feedback gate call
pub fn feedback_gate_prompt(
    config: &AgentFeedbackConfig,
    tenant: &TenantConfig,
    window: &Window,
) -> String {
    format!(
        "{}Feedback definition: {}\n\nConversation window:\n{}\n\nDecide whether this window \
         contains any observation matching the feedback definition.",
        context_section(tenant),
        config.feedback_definition_prompt,
        render_transcript(window, DEFAULT_PROMPT_TOKEN_BUDGET),
    )
}

/// The feedback extraction call
pub fn feedback_extraction_prompt(
    config: &AgentFeedbackConfig,
    tenant: &TenantConfig,
    window: &Window,
) -> String {
    let mut prompt = context_section(tenant);
    prompt.push_str(&format!(
        "You observe agent behavior and record structured feedback.\n\
         Feedback definition: {}\n",
        config.feedback_definition_prompt
    ));
    if let Some(metadata) = &config.metadata_definition_prompt {
        prompt.push_str(&format!("Additional metadata guidance: {metadata}\n"));
    }
    prompt.push_str(&format!(
        "\nConversation window:\n{}\n\n\
         Extract every matching observation. For each, state what the agent should do \
         (do_action), should not do (do_not_action), and the triggering condition \
         (when_condition). Record a blocking_issue only when the agent could not satisfy \
         the request; classify its kind as one of missing_capability, wrong_tool, \
         policy_block, input_ambiguity, other.",
        render_transcript(window, DEFAULT_PROMPT_TOKEN_BUDGET),
    ));
    prompt
}

/// The cluster consolidation call
pub fn aggregation_prompt(feedback_name: &str, cluster: &[RawFeedback]) -> String {
    let mut prompt = format!(
        "The following observations about the \"{feedback_name}\" behavior of one agent \
         version cluster together:\n\n"
    );
    for feedback in cluster {
        prompt.push_str(&format!("- {}", feedback.feedback_content));
        if let Some(when) = &feedback.when_condition {
            prompt.push_str(&format!(" (when: {when})"));
        }
        if let Some(action) = &feedback.do_action {
            prompt.push_str(&format!(" (do: {action})"));
        }
        if let Some(avoid) = &feedback.do_not_action {
            prompt.push_str(&format!(" (do not: {avoid})"));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "\nConsolidate them into a single behavioral rule with one feedback_content summary, \
         one do_action, one do_not_action, and one when_condition covering the shared \
         triggering condition. Carry over a blocking_issue only if the cluster agrees on one.",
    );
    prompt
}

/// The per-request success evaluation call
pub fn success_prompt(
    config: &AgentSuccessConfig,
    tenant: &TenantConfig,
    window: &Window,
) -> String {
    let mut prompt = context_section(tenant);
    if let Some(tools) = &config.tool_can_use {
        if !tools.is_empty() {
            prompt.push_str("Evaluation-specific tools:\n");
            for tool in tools {
                prompt.push_str(&format!("- {}: {}\n", tool.tool_name, tool.tool_description));
            }
            prompt.push('\n');
        }
    }
    prompt.push_str(&format!(
        "Success definition: {}\n\nFull request transcript:\n{}\n\n\
         Judge whether the agent satisfied the request. On failure, name a short \
         failure_type, explain the failure_reason, and, if a prompt change would have \
         prevented it, propose agent_prompt_update.",
        config.success_definition_prompt,
        render_transcript(window, DEFAULT_PROMPT_TOKEN_BUDGET),
    ));
    prompt
}

/// The skill synthesis call over one approved aggregate
pub fn skill_prompt(
    feedback_name: &str,
    feedback_content: &str,
    do_action: Option<&str>,
    do_not_action: Option<&str>,
    when_condition: Option<&str>,
) -> String {
    let mut prompt = format!(
        "An approved behavioral rule for the \"{feedback_name}\" behavior:\n\
         Summary: {feedback_content}\n"
    );
    if let Some(when) = when_condition {
        prompt.push_str(&format!("When: {when}\n"));
    }
    if let Some(action) = do_action {
        prompt.push_str(&format!("Do: {action}\n"));
    }
    if let Some(avoid) = do_not_action {
        prompt.push_str(&format!("Do not: {avoid}\n"));
    }
    prompt.push_str(
        "\nTurn this rule into a reusable skill: a short skill_name, a one-sentence \
         description, and instructions written as imperative guidance an agent prompt can \
         embed verbatim.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_core::{Interaction, Request, WindowItem, WindowMode};
    use engram_types::{Role, UserAction};

    fn window_with_contents(contents: &[&str]) -> Window {
        let now = Utc::now();
        let items = contents
            .iter()
            .enumerate()
            .map(|(idx, content)| WindowItem {
                interaction: Interaction {
                    org_id: "org".to_string(),
                    interaction_id: idx as i64 + 1,
                    request_id: "r1".to_string(),
                    user_id: "u1".to_string(),
                    role: Role::User,
                    content: content.to_string(),
                    shadow_content: None,
                    user_action: UserAction::None,
                    user_action_description: None,
                    interacted_image_url: None,
                    image_encoding: None,
                    tools_used: Vec::new(),
                    embedding: Vec::new(),
                    deleted: false,
                    created_at: now,
                },
                request: Request {
                    org_id: "org".to_string(),
                    request_id: "r1".to_string(),
                    user_id: "u1".to_string(),
                    source: "chat".to_string(),
                    agent_version: String::new(),
                    request_group: None,
                    created_at: now,
                },
            })
            .collect();
        Window {
            mode: WindowMode::Incremental,
            items,
        }
    }

    #[test]
    fn test_transcript_renders_roles() {
        let window = window_with_contents(&["I like blue shirts"]);
        let transcript = render_transcript(&window, DEFAULT_PROMPT_TOKEN_BUDGET);
        assert_eq!(transcript, "[User] I like blue shirts");
    }

    #[test]
    fn test_transcript_trims_oldest_first() {
        let long = "x".repeat(400);
        let window = window_with_contents(&[&long, &long, "newest message"]);
        // Budget fits roughly one long line
        let transcript = render_transcript(&window, 120);
        assert!(transcript.contains("newest message"));
        assert_eq!(transcript.matches("[User]").count(), 2);
    }

    #[test]
    fn test_transcript_always_keeps_newest() {
        let long = "y".repeat(4000);
        let window = window_with_contents(&[&long, &long]);
        let transcript = render_transcript(&window, 1);
        assert!(transcript.contains('y'));
        assert_eq!(transcript.matches("[User]").count(), 1);
    }
}
