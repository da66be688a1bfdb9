//! Per-session model of the typed command line and its live suggestion.
//!
//! The shell is the ground truth for what is on the prompt; this model is
//! reconstructed purely from the keystroke stream. Every transition runs
//! synchronously and reports an [`Effect`] the session coordinator must carry
//! out: publish the suggestion, or ask the completion oracle for a new one.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::CommandHistory;
use crate::keys::{classify, KeyToken};
use crate::oracle::CompletionRequest;

/// A predicted command and the part of it the user has not typed yet.
///
/// While a suggestion is held by a [`CommandState`],
/// `current_command + next_portion == full_command` and `next_portion` is
/// never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub full_command: String,
    pub next_portion: String,
}

impl Suggestion {
    /// Builds the suggestion for `full_command` relative to the typed buffer.
    ///
    /// Returns `None` when the prediction is empty, does not extend `current`,
    /// or has already been typed in full.
    pub fn for_buffer(full_command: impl Into<String>, current: &str) -> Option<Self> {
        let full_command = full_command.into();
        let next_portion = full_command.strip_prefix(current)?.to_string();
        if next_portion.is_empty() {
            return None;
        }
        Some(Self {
            full_command,
            next_portion,
        })
    }
}

/// A completion request tagged with the buffer generation it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionQuery {
    pub generation: u64,
    pub request: CompletionRequest,
    /// A suggestion was live before this transition and has been dropped.
    pub cleared: bool,
}

/// What the caller has to do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Unchanged,
    /// Send the suggestion (or its absence) to the UI.
    Publish(Option<Suggestion>),
    /// Schedule a debounced oracle query; resolve it with [`CommandState::resolve_suggestion`].
    Query(SuggestionQuery),
}

#[derive(Debug, Clone)]
pub struct CommandState {
    current_command: String,
    history: CommandHistory,
    history_index: usize,
    suggestion: Option<Suggestion>,
    /// Bumped on every buffer change; oracle answers for older generations are stale.
    generation: u64,
}

impl CommandState {
    pub fn new(history: CommandHistory) -> Self {
        let history_index = history.len();
        Self {
            current_command: String::new(),
            history,
            history_index,
            suggestion: None,
            generation: 0,
        }
    }

    pub fn current_command(&self) -> &str {
        &self.current_command
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn history_index(&self) -> usize {
        self.history_index
    }

    pub fn suggestion(&self) -> Option<&Suggestion> {
        self.suggestion.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Applies one keystroke chunk.
    pub fn handle_input(&mut self, input: &str) -> Effect {
        let effect = match classify(input) {
            KeyToken::Submit => self.submit(),
            KeyToken::Backspace => self.backspace(),
            KeyToken::HistoryUp => self.history_up(),
            KeyToken::HistoryDown => self.history_down(),
            KeyToken::Escape => Effect::Unchanged,
            KeyToken::Literal(text) => self.append(text),
        };
        debug!(
            buffer_len = self.current_command.len(),
            history_index = self.history_index,
            generation = self.generation,
            has_suggestion = self.suggestion.is_some(),
            "command state transition"
        );
        effect
    }

    /// Installs the oracle's answer for `generation`, unless the buffer has moved on.
    pub fn resolve_suggestion(&mut self, generation: u64, answer: Option<Suggestion>) -> Effect {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "discarding stale suggestion"
            );
            return Effect::Unchanged;
        }
        self.suggestion =
            answer.and_then(|s| Suggestion::for_buffer(s.full_command, &self.current_command));
        Effect::Publish(self.suggestion.clone())
    }

    fn submit(&mut self) -> Effect {
        let command = self.current_command.trim();
        if !command.is_empty() {
            self.history.push(command.to_string());
        }
        self.history_index = self.history.len();
        self.current_command.clear();
        self.generation += 1;
        match self.suggestion.take() {
            Some(_) => Effect::Publish(None),
            None => Effect::Unchanged,
        }
    }

    fn backspace(&mut self) -> Effect {
        if self.current_command.pop().is_none() {
            return Effect::Unchanged;
        }
        self.generation += 1;

        let Some(suggestion) = self.suggestion.as_mut() else {
            return Effect::Unchanged;
        };
        if suggestion.next_portion.is_empty() {
            return Effect::Unchanged;
        }
        // next_portion is always the tail of full_command.
        let offset = suggestion.full_command.len() - suggestion.next_portion.len();
        match suggestion.full_command[..offset].chars().next_back() {
            Some(previous) => {
                suggestion.next_portion.insert(0, previous);
                Effect::Publish(Some(suggestion.clone()))
            }
            None => Effect::Unchanged,
        }
    }

    fn history_up(&mut self) -> Effect {
        if self.history_index == 0 {
            return Effect::Unchanged;
        }
        self.history_index -= 1;
        self.load_history_entry()
    }

    fn history_down(&mut self) -> Effect {
        if self.history_index >= self.history.len() {
            return Effect::Unchanged;
        }
        self.history_index += 1;
        self.load_history_entry()
    }

    fn load_history_entry(&mut self) -> Effect {
        self.current_command = self
            .history
            .get(self.history_index)
            .unwrap_or_default()
            .to_string();
        self.requery()
    }

    fn append(&mut self, text: &str) -> Effect {
        self.current_command.push_str(text);
        self.generation += 1;

        if let Some(suggestion) = self.suggestion.as_mut() {
            if self.current_command == suggestion.full_command {
                self.suggestion = None;
                return Effect::Publish(None);
            }
            if suggestion.next_portion.starts_with(text) {
                suggestion.next_portion.drain(..text.len());
                return Effect::Publish(Some(suggestion.clone()));
            }
        }
        self.requery()
    }

    fn requery(&mut self) -> Effect {
        self.generation += 1;
        let cleared = self.suggestion.take().is_some();
        Effect::Query(SuggestionQuery {
            generation: self.generation,
            cleared,
            request: CompletionRequest {
                history: self.history.entries().to_vec(),
                partial: self.current_command.clone(),
            },
        })
    }
}
