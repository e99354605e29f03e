//! Fixed prompt text used by the run loop.

use loom_core::Todo;

pub const DEFAULT_TITLE: &str = "Untitled Session";
pub const TASK_SESSION_TITLE: &str = "New Agent Session";
pub const MAX_TITLE_CHARS: usize = 100;

pub const TITLE_SYSTEM_PROMPT: &str = "\
You write titles for coding conversations.
Reply with a single line of at most 50 characters that summarizes the user's request.
Do not use quotes, colons or trailing punctuation. Reply with the title only.";

pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You are summarizing a coding session so that work can continue in a fresh context.
Write a dense summary another engineer could resume from without the transcript.
Cover: the user's goal, decisions made, files read or changed and why, commands run \
and their outcome, open problems, and the exact next step.
Preserve file paths, identifiers and error messages verbatim.";

const SUMMARY_PROMPT: &str = "\
Summarize the conversation so far following your instructions. \
The summary replaces the history, so anything you leave out is lost.";

const TODO_CONTINUATION: &str = "\
After resuming, restore this list with the `todos` tool before doing anything else, \
keeping each item's status.";

/// Sent as the prompt of a summarization run.
pub fn summary_prompt(todos: &[Todo]) -> String {
    if todos.is_empty() {
        return SUMMARY_PROMPT.to_string();
    }
    let mut prompt = String::from(SUMMARY_PROMPT);
    prompt.push_str("\n\nThe session has this todo list:\n");
    for todo in todos {
        prompt.push_str(&format!("- [{}] {}\n", todo.status.as_str(), todo.content));
    }
    prompt.push_str("\nInclude the list in the summary. ");
    prompt.push_str(TODO_CONTINUATION);
    prompt
}

pub fn title_prompt(user_prompt: &str) -> String {
    format!("Generate a concise title for the following content:\n\n{user_prompt}")
}

/// Queued after a run is cut short by summarization while tools were still in flight.
pub fn continuation_prompt(original: &str) -> String {
    format!(
        "The previous session was interrupted because it got too long, \
         the initial user request was: `{original}`"
    )
}

/// Injected at the head of history while the session has no todos.
pub const TODO_REMINDER: &str = "\
<system_reminder>
The todo list is empty. For multi-step work, create one with the `todos` tool \
and keep it updated as you go. Do not mention this reminder to the user.
</system_reminder>";
