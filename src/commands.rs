use std::sync::LazyLock;

use regex::Regex;

use crate::config::DialogueConfig;

/// Discord rejects messages longer than this many characters.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

static MENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@!?(\d+)>").unwrap());

pub const BACKEND_ERROR_MESSAGE: &str = "The language model backend returned an error, \
    it is probably overloaded with other requests. \
    Try again later or clear the history with `/reset`.";

pub const SYSTEM_ERROR_MESSAGE: &str =
    "Something went wrong. Try clearing the history with `/reset`.";

pub const ROLE_USAGE_MESSAGE: &str = "A role is required: /role <role>";
pub const ROLE_SET_MESSAGE: &str = "Role set, history cleared";
pub const RESET_MESSAGE: &str = "Role restored to the default, history cleared";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Reset,
    /// `/role` with whatever followed it, possibly blank.
    Role(&'a str),
    Chat(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(text: &'a str) -> Self {
        let trimmed = text.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };

        match head {
            "/help" => Self::Help,
            "/reset" => Self::Reset,
            "/role" => Self::Role(rest),
            _ => Self::Chat(trimmed),
        }
    }
}

/// Whether a message is meant for the bot. Direct messages always are; in
/// shared channels the bot has to be mentioned or given a command.
pub fn is_addressed(text: &str, bot_id: u64, is_direct: bool) -> bool {
    if is_direct || text.trim_start().starts_with('/') {
        return true;
    }

    MENTION_PATTERN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .any(|id| id == bot_id)
}

pub fn strip_mentions(text: &str, bot_id: u64) -> String {
    MENTION_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            let id = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            if id == Some(bot_id) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .trim()
        .to_string()
}

pub fn render_help(role: &str, config: &DialogueConfig, support_contact: Option<&str>) -> String {
    let mut help = format!(
        "Commands:\n\
         - /help -- show this message\n\
         - /role <role> -- set a custom role\n\
         - /reset -- restore the default role and clear the history\n\
         \n\
         Maximum number of messages in history: {}, history lifetime: {} seconds.\n\
         Current role: '{}'\n\
         If the bot takes a long time to answer, the model backend is probably overloaded, \
         try again later.\n\
         If an answer is cut off, the token limit was exceeded, clear the history with /reset.",
        config.messages_in_history,
        config.max_alive_dialogue.num_seconds(),
        role,
    );

    if let Some(contact) = support_contact {
        help.push_str("\nQuestions: ");
        help.push_str(contact);
    }
    help
}

/// Splits a reply into chunks Discord will accept, preferring line breaks,
/// then spaces. Lengths are counted in characters.
pub fn split_message(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        let separator = usize::from(!current.is_empty());
        if current_len + separator + line_len <= MAX_MESSAGE_LENGTH {
            if separator == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += separator + line_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        let mut remaining = line;
        let mut remaining_len = line_len;
        while remaining_len > MAX_MESSAGE_LENGTH {
            let split_at = find_split_point(remaining, MAX_MESSAGE_LENGTH);
            let (head, tail) = remaining.split_at(split_at);
            chunks.push(head.to_string());
            remaining_len -= head.chars().count();
            remaining = tail;
        }
        current.push_str(remaining);
        current_len = remaining_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Byte offset at which to cut `text` so the head has at most `max_chars`
/// characters, backing up to the last space when there is one.
fn find_split_point(text: &str, max_chars: usize) -> usize {
    let boundary = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(offset, _)| offset);

    match text[..boundary].rfind(' ') {
        Some(pos) if pos > 0 => pos + 1,
        _ => boundary,
    }
}
