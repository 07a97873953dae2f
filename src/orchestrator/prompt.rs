//! Prompt composition and step summaries.

use std::sync::LazyLock;

use regex::Regex;

use crate::runner::AgentOutput;
use crate::tasks::{ChatRole, PersistedTask};

static HTML_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]+>").ok());

const RECENT_STEPS: usize = 5;
const EARLIER_FOLLOWUPS: usize = 4;

pub fn strip_html(value: &str) -> String {
    match HTML_TAG.as_ref() {
        Some(re) => re.replace_all(value, "").trim().to_string(),
        None => value.trim().to_string(),
    }
}

/// Build the prompt for the next run from the task's transcript and recent steps.
pub fn compose_prompt(task: &PersistedTask) -> String {
    let history = &task.chat_history;
    let primary = history
        .first()
        .map(|m| m.content.as_str())
        .unwrap_or(task.record.instructions.as_str());

    let followups: Vec<&str> = history
        .iter()
        .skip(1)
        .filter(|m| m.role == ChatRole::User && !m.content.trim().is_empty())
        .map(|m| m.content.trim())
        .collect();

    let mut sections = Vec::new();
    if !primary.trim().is_empty() {
        sections.push(format!("Primary goal:\n{}", primary.trim()));
    }
    if let Some((current, earlier)) = followups.split_last() {
        let earlier = &earlier[earlier.len().saturating_sub(EARLIER_FOLLOWUPS)..];
        if !earlier.is_empty() {
            let bullets: Vec<String> = earlier.iter().map(|f| format!("- {f}")).collect();
            sections.push(format!("Earlier follow-up requests:\n{}", bullets.join("\n")));
        }
        sections.push(format!("Current follow-up request:\n{current}"));
    }

    let steps = &task.steps[task.steps.len().saturating_sub(RECENT_STEPS)..];
    if !steps.is_empty() {
        let lines: Vec<String> = steps
            .iter()
            .map(|step| {
                let mut summary = strip_html(&step.summary_html);
                if summary.is_empty() {
                    summary = match (&step.title, &step.url) {
                        (Some(title), _) if !title.is_empty() => title.clone(),
                        (_, Some(url)) if !url.is_empty() => format!("Visited {url}"),
                        _ => "No summary provided.".to_string(),
                    };
                }
                format!("Step {}: {summary}", step.step_number)
            })
            .collect();
        sections.push(format!("Completed steps so far:\n{}", lines.join("\n")));
    }

    sections.push(
        "Continue from the existing browser session. Build on the completed work instead of starting over."
            .to_string(),
    );
    sections.join("\n\n")
}

/// Render an agent output as a JSON code block for the step log.
pub fn format_agent_output(output: &AgentOutput) -> String {
    let payload = match output {
        AgentOutput::None => return String::new(),
        AgentOutput::Plan {
            evaluation,
            memory,
            next_goal,
            actions,
        } => serde_json::json!({
            "current_state": {
                "evaluation_previous_goal": evaluation,
                "memory": memory,
                "next_goal": next_goal,
            },
            "action": actions,
        }),
        AgentOutput::Message { text } => serde_json::json!({ "message": text }),
    };
    match serde_json::to_string_pretty(&payload) {
        Ok(json) => format!("<pre><code class='language-json'>{json}</code></pre>"),
        Err(_) => format!("<pre><code>{payload}</code></pre>"),
    }
}
