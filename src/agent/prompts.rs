// src/agent/prompts.rs

//! Prompt construction and verification-reply parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::plan::Milestone;

/// Upper bound on the carried-forward context summary, in characters.
pub const MAX_CONTEXT_SUMMARY: usize = 4_000;
const SUMMARY_EXCERPT: usize = 280;

static VERDICT_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\{[^{}]*"passed"[^{}]*\}"#).expect("invalid verdict pattern"));

static VERDICT_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:verdict\s*:\s*)?(pass|passed|fail|failed)\b[\s:.-]*(.*)$")
        .expect("invalid verdict keyword pattern")
});

/// Everything a prompt may refer to.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub goal: &'a str,
    pub milestone: &'a Milestone,
    /// What earlier milestones produced.
    pub context_summary: &'a str,
    /// Strategy hint for the current phase, from the plan's `thinking` map.
    pub thinking: Option<&'a str>,
}

/// Outcome of a verification reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

/// How the engine phrases its requests to the agent.
pub trait PromptStrategy: Send + Sync {
    fn execution(&self, ctx: &PromptContext<'_>) -> String;
    fn verification(&self, ctx: &PromptContext<'_>) -> String;
    fn recovery(&self, ctx: &PromptContext<'_>, failure: &str, attempt: u32) -> String;
    fn corrective(&self, ctx: &PromptContext<'_>, repeated: &str) -> String;

    fn parse_verdict(&self, reply: &str) -> Verdict {
        parse_verdict(reply)
    }

    /// Fold a finished milestone's reply into the running summary.
    fn summarize(&self, previous: &str, milestone: &Milestone, reply: &str) -> String {
        let excerpt = reply.split_whitespace().collect::<Vec<_>>().join(" ");
        let excerpt = crate::state::truncate_text(&excerpt, SUMMARY_EXCERPT);
        let mut summary = previous.to_string();
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&format!("- {}: {}", milestone.title, excerpt));
        keep_tail(&summary, MAX_CONTEXT_SUMMARY)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultPrompts;

impl DefaultPrompts {
    fn header(ctx: &PromptContext<'_>) -> String {
        let mut out = format!("Overall goal: {}\n", ctx.goal);
        if !ctx.context_summary.is_empty() {
            out.push_str("\nProgress so far:\n");
            out.push_str(ctx.context_summary);
            out.push('\n');
        }
        if let Some(hint) = ctx.thinking {
            out.push_str(&format!("\nApproach: {hint}\n"));
        }
        out.push_str(&format!(
            "\nCurrent milestone [{}]: {}\n",
            ctx.milestone.id, ctx.milestone.title
        ));
        if !ctx.milestone.description.is_empty() {
            out.push_str(&ctx.milestone.description);
            out.push('\n');
        }
        out
    }
}

impl PromptStrategy for DefaultPrompts {
    fn execution(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = Self::header(ctx);
        if !ctx.milestone.artifacts.is_empty() {
            let paths: Vec<String> = ctx
                .milestone
                .artifacts
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            prompt.push_str(&format!("\nExpected artifacts: {}\n", paths.join(", ")));
        }
        prompt.push_str("\nComplete this milestone now and report what you did.");
        prompt
    }

    fn verification(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = Self::header(ctx);
        prompt.push_str("\nCheck whether the milestone is done:\n");
        for step in &ctx.milestone.verification_steps {
            prompt.push_str(&format!("- {step}\n"));
        }
        prompt.push_str(
            "\nAnswer with JSON only: {\"passed\": true|false, \"reason\": \"...\"}",
        );
        prompt
    }

    fn recovery(&self, ctx: &PromptContext<'_>, failure: &str, attempt: u32) -> String {
        let mut prompt = Self::header(ctx);
        prompt.push_str(&format!(
            "\nThe previous attempt failed (retry {attempt} of {}):\n{failure}\n\
             Fix the cause and finish the milestone.",
            ctx.milestone.max_retries
        ));
        prompt
    }

    fn corrective(&self, ctx: &PromptContext<'_>, repeated: &str) -> String {
        let mut prompt = Self::header(ctx);
        prompt.push_str(&format!(
            "\nYou have produced essentially the same reply several times:\n{}\n\
             Stop repeating it. Step back, pick a different approach, and say what you will change.",
            crate::state::truncate_text(repeated, 500)
        ));
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct VerdictJson {
    passed: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse a verification reply.
///
/// Accepts a JSON object with a boolean `passed` anywhere in the text (the
/// last one wins), else a line starting with PASS/FAIL. Anything else counts
/// as a failure.
pub fn parse_verdict(reply: &str) -> Verdict {
    if let Some(v) = VERDICT_JSON
        .find_iter(reply)
        .filter_map(|m| serde_json::from_str::<VerdictJson>(m.as_str()).ok())
        .last()
    {
        return Verdict {
            passed: v.passed,
            reason: v.reason.unwrap_or_default(),
        };
    }

    if let Some(caps) = VERDICT_WORD.captures(reply) {
        let word = caps[1].to_lowercase();
        return Verdict {
            passed: word.starts_with("pass"),
            reason: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        };
    }

    Verdict {
        passed: false,
        reason: "unparseable verification reply".to_string(),
    }
}

fn keep_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
