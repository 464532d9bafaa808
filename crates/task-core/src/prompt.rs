//! Prompt assembly for agent phases, change requests and conflict resolution.

use crate::types::{Phase, PromptCycle, TaskMode};

/// Maximum characters of the slug derived from a prompt.
const SLUG_MAX: usize = 40;

/// Instructions prepended to the task prompt for each phase.
pub fn phase_prompt(phase: Phase, mode: TaskMode, task_prompt: &str) -> String {
    match phase {
        Phase::Planner => format!(
            "You are the planner. Read the repository and write a concrete, step-by-step \
             implementation plan for the task below to PLAN.md in the repository root. \
             Do not change any other file.\n\nTask:\n{task_prompt}\n"
        ),
        Phase::Editor => {
            let plan_hint = if mode == TaskMode::Plan {
                "Follow the plan in PLAN.md and delete PLAN.md when you are done.\n\n"
            } else {
                ""
            };
            format!(
                "You are the editor. Implement the task below by editing files in this \
                 repository. Do not commit; the orchestrator commits for you.\n\n\
                 {plan_hint}Task:\n{task_prompt}\n"
            )
        }
        Phase::Reviewer => format!(
            "You are the reviewer. Inspect the uncommitted changes with `git diff` and \
             `git status`. Fix any bugs, missing pieces or failing tests you find so the \
             changes fully accomplish the task below. Do not commit.\n\nTask:\n{task_prompt}\n"
        ),
        Phase::Done => task_prompt.to_string(),
    }
}

/// Prompt for a follow-up task created by a change request.
///
/// Embeds the original prompt and every earlier change request so the new
/// agent has the whole history, and tells it to read the existing diff first.
pub fn change_request_prompt(
    original_prompt: &str,
    earlier_cycles: &[PromptCycle],
    request: &str,
) -> String {
    let mut out = String::new();
    out.push_str("This workspace already contains work for an earlier request. ");
    out.push_str(
        "Before changing anything, run `git log` and `git diff` against the base branch \
         to understand what was already done.\n\n",
    );
    out.push_str("## Original request\n");
    out.push_str(original_prompt.trim());
    out.push_str("\n\n");

    let previous: Vec<&str> = earlier_cycles
        .iter()
        .filter_map(|c| c.change_request.as_deref())
        .collect();
    if !previous.is_empty() {
        out.push_str("## Previous change requests\n");
        for (idx, text) in previous.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", idx + 1, text.trim()));
        }
        out.push('\n');
    }

    out.push_str("## Requested changes\n");
    out.push_str(request.trim());
    out.push('\n');
    out
}

/// Directive prompt for the conflict resolver.
pub fn conflict_resolution_prompt(
    task_prompt: &str,
    branch: &str,
    conflicted_paths: &[String],
    diff: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "A merge of branch `{branch}` stopped with conflicts. Resolve every conflict in \
         the files listed below.\n\n"
    ));
    out.push_str(
        "Rules:\n\
         - Prefer the behavior the task intended.\n\
         - Keep unrelated upstream changes intact.\n\
         - Remove all conflict markers and stage each resolved file with `git add`.\n\
         - Do not commit and do not abort the merge.\n\n",
    );
    out.push_str("## Task\n");
    out.push_str(task_prompt.trim());
    out.push_str("\n\n## Conflicted files\n");
    for path in conflicted_paths {
        out.push_str(&format!("- {path}\n"));
    }
    if !diff.is_empty() {
        out.push_str("\n## The task's changes against its base\n```diff\n");
        out.push_str(diff);
        if !diff.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");
    }
    out
}

/// Truncate `text` to at most `max_bytes`, on a char boundary, marking the cut.
pub fn truncate_for_prompt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]\n", &text[..end])
}

/// Lowercase slug from free text: alphanumerics kept, runs of anything else
/// collapsed to a single dash, bounded length.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= SLUG_MAX {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}
