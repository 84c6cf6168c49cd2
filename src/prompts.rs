//! Prompt templates for the AI agent invocations.
//!
//! Plain `format!` templates; the agent sees issue context, the comment
//! thread (full or incremental), and for PR descriptions a capped diff
//! stat so huge changes cannot blow out the prompt.

use crate::clients::Comment;
use crate::workspace::Prd;

/// Maximum number of per-file lines included from a diff stat.
pub const MAX_DIFF_STAT_FILES: usize = 50;

/// Initial refine prompt: full thread plus the issue description.
pub fn refine_prompt(
    title: &str,
    description: &str,
    comments: &[Comment],
    knowledge_path: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are refining an issue into an implementation plan.\n\n\
         ## ISSUE\n{}\n\n## DESCRIPTION\n{}\n",
        title,
        if description.is_empty() {
            "(no description)"
        } else {
            description
        }
    );
    if let Some(path) = knowledge_path {
        prompt.push_str(&format!(
            "\n## PROJECT KNOWLEDGE\nConsult {} for repository conventions.\n",
            path
        ));
    }
    if !comments.is_empty() {
        prompt.push_str("\n## DISCUSSION SO FAR\n");
        push_comments(&mut prompt, comments);
    }
    prompt.push_str(
        "\n## TASK\nEither propose a concrete implementation plan, or ask clarifying \
         questions if the issue is underspecified.\n\
         Start your response with `<!-- type: plan -->` or `<!-- type: questions -->`.\n",
    );
    prompt
}

/// Incremental refine prompt: only the comments after the cursor, with a
/// brief context prefix instead of the full thread and description.
pub fn iteration_prompt(title: &str, new_comments: &[Comment]) -> String {
    let mut prompt = format!("Continuing refinement of: {}\n\n## NEW REPLIES\n", title);
    push_comments(&mut prompt, new_comments);
    prompt.push_str(
        "\n## TASK\nRespond to the new replies, updating the plan or answering the \
         questions raised.\n\
         Start your response with `<!-- type: plan -->` or `<!-- type: questions -->`.\n",
    );
    prompt
}

/// Prompt asking the agent to materialize the PRD JSON in the workspace.
pub fn prd_prompt(title: &str, plan_text: &str, prd_path: &str) -> String {
    format!(
        "Turn the approved plan below into a product requirements document.\n\n\
         ## ISSUE\n{}\n\n## APPROVED PLAN\n{}\n\n## TASK\n\
         Write a JSON file at {} with the shape:\n\
         {{\"description\": \"...\", \"stories\": [{{\"id\": \"S1\", \"title\": \"...\", \
         \"acceptance\": \"...\"}}]}}\n\
         Each story must be independently verifiable.\n",
        title,
        if plan_text.is_empty() {
            "(no plan captured; derive one from the issue)"
        } else {
            plan_text
        },
        prd_path
    )
}

/// Prompt generating a PR title and body. The first line of the response is
/// the title; the remainder is the body.
pub fn pr_description_prompt(identifier: &str, prd: &Prd, diff_stat: &str) -> String {
    let stories: String = prd
        .stories
        .iter()
        .map(|s| format!("- {}: {}\n", s.id, s.title))
        .collect();
    format!(
        "Write a pull request title and body for the change below.\n\
         The first line of your response is the title; everything after is the body.\n\n\
         ## ISSUE\n{}\n\n## WHAT WAS BUILT\n{}\n\n## STORIES\n{}\n## DIFF STAT\n{}\n",
        identifier,
        prd.description,
        stories,
        cap_diff_stat(diff_stat, MAX_DIFF_STAT_FILES)
    )
}

/// Prompt for addressing human PR review feedback inside the worktree.
pub fn feedback_prompt(identifier: &str, reviews: &[(String, String)]) -> String {
    let mut prompt = format!(
        "Reviewers left feedback on the pull request for {}. Address each point \
         with code changes in this working tree.\n\n## FEEDBACK\n",
        identifier
    );
    for (author, body) in reviews {
        prompt.push_str(&format!("### {}\n{}\n\n", author, body));
    }
    prompt.push_str("## TASK\nApply the requested changes and keep the tests passing.\n");
    prompt
}

/// Cap a `git diff --stat` dump: at most `max_files` file lines, an omission
/// marker when any were dropped, and always the final summary line.
pub fn cap_diff_stat(stat: &str, max_files: usize) -> String {
    let lines: Vec<&str> = stat.lines().collect();
    if lines.len() <= 1 {
        return stat.to_string();
    }
    let (file_lines, summary) = lines.split_at(lines.len() - 1);
    if file_lines.len() <= max_files {
        return stat.to_string();
    }
    let omitted = file_lines.len() - max_files;
    let mut out: Vec<String> = file_lines[..max_files]
        .iter()
        .map(|l| l.to_string())
        .collect();
    out.push(format!("[... {} file entries omitted ...]", omitted));
    out.push(summary[0].to_string());
    out.join("\n")
}

fn push_comments(prompt: &mut String, comments: &[Comment]) {
    for c in comments {
        prompt.push_str(&format!("### {}\n{}\n\n", c.author_name, c.body));
    }
}
