//! Classification of raw keystroke chunks coming from the terminal UI.

const CARRIAGE_RETURN: &str = "\r";
const DELETE: &str = "\x7f";
const BACKSPACE: &str = "\x08";
const ARROW_UP: &[&str] = &["\x1b[A", "\x1bOA"];
const ARROW_DOWN: &[&str] = &["\x1b[B", "\x1bOB"];
const ESCAPE: char = '\x1b';

/// One keystroke chunk as the command state machine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyToken<'a> {
    Submit,
    Backspace,
    HistoryUp,
    HistoryDown,
    /// Any other escape-prefixed sequence. Forwarded to the shell, ignored by the model.
    Escape,
    Literal(&'a str),
}

/// Classifies a chunk exactly as received; no splitting of multi-key chunks is attempted.
pub fn classify(input: &str) -> KeyToken<'_> {
    match input {
        CARRIAGE_RETURN => KeyToken::Submit,
        DELETE | BACKSPACE => KeyToken::Backspace,
        s if ARROW_UP.contains(&s) => KeyToken::HistoryUp,
        s if ARROW_DOWN.contains(&s) => KeyToken::HistoryDown,
        s if s.starts_with(ESCAPE) => KeyToken::Escape,
        s => KeyToken::Literal(s),
    }
}
