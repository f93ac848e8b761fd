//! Stage prompt rendering.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::io::generator::Stage;

const RESEARCH_TEMPLATE: &str = include_str!("prompts/research.md");
const DESIGN_TEMPLATE: &str = include_str!("prompts/design.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (stage, source) in [
        (Stage::Research, RESEARCH_TEMPLATE),
        (Stage::Design, DESIGN_TEMPLATE),
        (Stage::Plan, PLAN_TEMPLATE),
        (Stage::Implement, IMPLEMENT_TEMPLATE),
    ] {
        env.add_template(stage.as_str(), source)
            .expect("stage templates should be valid");
    }
    env
});

/// Everything the stage prompts can reference.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub research: Option<&'a str>,
    pub design: Option<&'a str>,
    pub plan: Option<&'a str>,
    pub impacted_files: Option<&'a BTreeSet<String>>,
    pub feedback: Option<&'a str>,
    pub attempt: u32,
    pub max_retries: u32,
}

fn clean(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

pub fn render_prompt(stage: Stage, inputs: &PromptInputs<'_>) -> Result<String> {
    let template = ENGINE
        .get_template(stage.as_str())
        .with_context(|| format!("load {stage} template"))?;
    let impacted: Vec<&str> = inputs
        .impacted_files
        .map(|set| set.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let rendered = template
        .render(context! {
            task => inputs.task.trim(),
            research => clean(inputs.research).unwrap_or("(none)"),
            design => clean(inputs.design).unwrap_or("(none)"),
            plan => clean(inputs.plan).unwrap_or("(none)"),
            impacted_files => impacted,
            feedback => clean(inputs.feedback),
            attempt => inputs.attempt,
            max_retries => inputs.max_retries,
        })
        .with_context(|| format!("render {stage} prompt"))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn research_prompt_carries_task() {
        let out = render_prompt(
            Stage::Research,
            &PromptInputs {
                task: "  add health route  ",
                ..PromptInputs::default()
            },
        )
        .expect("render");
        assert!(out.contains("## Task\n\nadd health route\n"));
    }

    #[test]
    fn implement_prompt_lists_files_and_feedback() {
        let files: BTreeSet<String> = ["server/routes.js".to_string()].into();
        let out = render_prompt(
            Stage::Implement,
            &PromptInputs {
                task: "add health route",
                plan: Some("edit server/routes.js"),
                impacted_files: Some(&files),
                feedback: Some("tests failed: health.test.js"),
                attempt: 2,
                max_retries: 3,
                ..PromptInputs::default()
            },
        )
        .expect("render");
        assert!(out.contains("attempt 2 of 3"));
        assert!(out.contains("- `server/routes.js`"));
        assert!(out.contains("## Feedback from previous attempts\n\ntests failed: health.test.js"));
        assert!(out.contains("## Design\n\n(none)"));
    }

    #[test]
    fn first_attempt_omits_feedback_section() {
        let out = render_prompt(
            Stage::Implement,
            &PromptInputs {
                task: "t",
                attempt: 1,
                max_retries: 3,
                ..PromptInputs::default()
            },
        )
        .expect("render");
        assert!(!out.contains("Feedback from previous attempts"));
        assert!(out.contains("only `.pipeline/` is writable"));
    }
}
