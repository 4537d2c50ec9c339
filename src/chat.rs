use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Local};
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::clipboard::Clipboard;

pub const WELCOME_MESSAGE: &str = "👋 Welcome! I'm Vision, your personal financial guide. Whether you're looking to grow your wealth, plan for the future, or make smarter money decisions, I'm here to help with personalized advice tailored just for you. What's on your mind today?";
pub const RESET_MESSAGE: &str =
    "👋 Welcome! I'm Vision, your personal financial guide. What financial questions can I help you with today?";
pub const QUICK_SUGGESTIONS: [&str; 5] = [
    "How can I start investing with little money?",
    "What's the best way to save for retirement?",
    "How do I create a monthly budget?",
    "Should I pay off debt or invest first?",
    "How can I improve my credit score?",
];

const NEW_MESSAGE_HIGHLIGHT: Duration = Duration::from_secs(1);
const COPY_STATUS_VISIBLE: Duration = Duration::from_secs(2);
const SUGGESTION_MESSAGE_LIMIT: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("API key is missing. Set GEMINI_API_KEY or pass --gemini-api-key.")]
    MissingCredential,
    #[error("request to the language model failed: {0}")]
    Transport(String),
    #[error("language model returned an error: {0}")]
    Model(String),
    #[error("language model returned an empty response")]
    EmptyResponse,
}

/// One outbound generation call. Implementations must resolve (success or
/// error) so the session can release its busy flag.
pub trait LanguageModel: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, ChatError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn transcript_label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Role::User => "You",
            Role::Assistant => "Vision",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Local>,
    highlight_until: Option<Instant>,
}

impl Message {
    /// Transient "new" display flag.
    pub fn is_new(&self) -> bool {
        self.highlight_until.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendRejected {
    Empty,
    Busy,
}

/// Work handed to the background task after `begin_send`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub epoch: u64,
    pub prompt: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Replied,
    Failed,
    /// The conversation was reset while the request was in flight.
    Discarded,
}

pub struct ChatSession {
    messages: Vec<Message>,
    busy: bool,
    epoch: u64,
    last_error: Option<String>,
    copy_status: Option<(String, Instant)>,
    scroll: ScrollTracker,
}

impl Default for ChatSession {
    fn default() -> Self {
        ChatSession::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        let mut session = ChatSession {
            messages: Vec::new(),
            busy: false,
            epoch: 0,
            last_error: None,
            copy_status: None,
            scroll: ScrollTracker::default(),
        };
        session.push(Role::Assistant, WELCOME_MESSAGE.to_string(), None);
        session
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn scroll(&self) -> &ScrollTracker {
        &self.scroll
    }

    pub fn scroll_mut(&mut self) -> &mut ScrollTracker {
        &mut self.scroll
    }

    /// Canned questions, offered only at the start of a conversation.
    pub fn suggestions(&self) -> Option<&'static [&'static str]> {
        if self.messages.len() < SUGGESTION_MESSAGE_LIMIT {
            Some(&QUICK_SUGGESTIONS)
        } else {
            None
        }
    }

    /// Validates and records the user's message, marks the session busy and
    /// returns the prompt to submit. Nothing changes when rejected.
    pub fn begin_send(&mut self, text: &str) -> Result<PendingRequest, SendRejected> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SendRejected::Empty);
        }
        if self.busy {
            return Err(SendRejected::Busy);
        }
        let prompt = build_prompt(&self.messages, trimmed);
        self.push(Role::User, trimmed.to_string(), None);
        self.busy = true;
        self.last_error = None;
        self.scroll.follow();
        Ok(PendingRequest {
            epoch: self.epoch,
            prompt,
        })
    }

    /// Applies the outcome of the request started by `begin_send`.
    pub fn complete(
        &mut self,
        epoch: u64,
        result: Result<String, ChatError>,
        now: Instant,
    ) -> Completion {
        self.busy = false;
        if epoch != self.epoch {
            return Completion::Discarded;
        }
        match result {
            Ok(text) => {
                self.push(Role::Assistant, text, Some(now + NEW_MESSAGE_HIGHLIGHT));
                Completion::Replied
            }
            Err(err) => {
                let detail = err.to_string();
                let text = format!(
                    "I apologize, but I encountered an error while processing your request. Error details: {detail}"
                );
                self.last_error = Some(detail);
                self.push(Role::Assistant, text, None);
                Completion::Failed
            }
        }
    }

    pub async fn send(
        &mut self,
        text: &str,
        model: &dyn LanguageModel,
    ) -> Result<Completion, SendRejected> {
        let pending = self.begin_send(text)?;
        let result = model.generate(&pending.prompt).await;
        Ok(self.complete(pending.epoch, result, Instant::now()))
    }

    /// Replaces the history with a single greeting. Requires confirmation.
    /// A request still in flight keeps the session busy until it resolves and
    /// its reply is then dropped.
    pub fn reset(&mut self, confirmed: bool, now: Instant) -> bool {
        if !confirmed {
            return false;
        }
        self.epoch += 1;
        self.messages.clear();
        self.last_error = None;
        self.scroll = ScrollTracker::default();
        self.push(
            Role::Assistant,
            RESET_MESSAGE.to_string(),
            Some(now + NEW_MESSAGE_HIGHLIGHT),
        );
        true
    }

    /// Clears expired "new" flags. Returns true when anything changed.
    pub fn expire_highlights(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for message in &mut self.messages {
            if matches!(message.highlight_until, Some(until) if until <= now) {
                message.highlight_until = None;
                changed = true;
            }
        }
        if matches!(self.copy_status, Some((_, until)) if until <= now) {
            self.copy_status = None;
            changed = true;
        }
        changed
    }

    pub fn copy_message(&mut self, index: usize, clipboard: &dyn Clipboard, now: Instant) -> bool {
        let Some(message) = self.messages.get(index) else {
            return false;
        };
        if message.role != Role::Assistant {
            return false;
        }
        let status = match clipboard.write_text(&message.text) {
            Ok(()) => "Copied!",
            Err(_) => "Failed to copy",
        };
        self.copy_status = Some((status.to_string(), now + COPY_STATUS_VISIBLE));
        true
    }

    pub fn copy_status(&self) -> Option<&str> {
        self.copy_status.as_ref().map(|(status, _)| status.as_str())
    }

    fn push(&mut self, role: Role, text: String, highlight_until: Option<Instant>) {
        let timestamp = self.next_timestamp();
        self.messages.push(Message {
            role,
            text,
            timestamp,
            highlight_until,
        });
    }

    fn next_timestamp(&self) -> DateTime<Local> {
        let now = Local::now();
        match self.messages.last() {
            Some(last) if now <= last.timestamp => last.timestamp + ChronoDuration::milliseconds(1),
            _ => now,
        }
    }
}

pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role.transcript_label(), message.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_prompt(history: &[Message], input: &str) -> String {
    let transcript = render_transcript(history);
    if transcript.is_empty() {
        format!("User: {input}")
    } else {
        format!("{transcript}\n\nUser: {input}")
    }
}

/// Tracks how far the conversation view sits above its newest row.
#[derive(Clone, Debug)]
pub struct ScrollTracker {
    rows_from_bottom: usize,
    threshold: usize,
}

impl Default for ScrollTracker {
    fn default() -> Self {
        ScrollTracker {
            rows_from_bottom: 0,
            threshold: 3,
        }
    }
}

impl ScrollTracker {
    pub fn rows_from_bottom(&self) -> usize {
        self.rows_from_bottom
    }

    pub fn auto_scroll(&self) -> bool {
        self.rows_from_bottom <= self.threshold
    }

    pub fn show_jump_to_latest(&self) -> bool {
        !self.auto_scroll()
    }

    pub fn scroll_up(&mut self, rows: usize, max_rows: usize) {
        self.rows_from_bottom = self.rows_from_bottom.saturating_add(rows).min(max_rows);
    }

    pub fn scroll_down(&mut self, rows: usize) {
        self.rows_from_bottom = self.rows_from_bottom.saturating_sub(rows);
    }

    pub fn follow(&mut self) {
        self.rows_from_bottom = 0;
    }

    /// Keeps the viewport anchored when rows are appended below it.
    pub fn content_grew(&mut self, added_rows: usize) {
        if self.auto_scroll() {
            self.rows_from_bottom = 0;
        } else {
            self.rows_from_bottom = self.rows_from_bottom.saturating_add(added_rows);
        }
    }
}
