//! Bounded, deduplicated command history and shell-history seeding.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Ordered past commands, oldest first.
///
/// Pushing a command that is already present moves it to the newest slot, so
/// every entry appears at most once and chronological order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHistory {
    entries: Vec<String>,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn with_entries<I, S>(capacity: usize, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut history = Self::new(capacity);
        for entry in entries {
            history.push(entry);
        }
        history
    }

    pub fn push(&mut self, command: impl Into<String>) {
        let command = command.into();
        self.entries.retain(|existing| *existing != command);
        self.entries.push(command);
        if self.entries.len() > self.capacity {
            let overflow = self.entries.len() - self.capacity;
            self.entries.drain(..overflow);
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Shells whose history file layout we know how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Zsh,
    Bash,
    Other,
}

impl ShellKind {
    pub fn from_shell_path(shell: &str) -> Self {
        if shell.contains("zsh") {
            ShellKind::Zsh
        } else if shell.contains("bash") {
            ShellKind::Bash
        } else {
            ShellKind::Other
        }
    }

    fn history_file(self, home: &Path) -> Option<PathBuf> {
        match self {
            ShellKind::Zsh => Some(home.join(".zsh_history")),
            ShellKind::Bash => Some(home.join(".bash_history")),
            ShellKind::Other => None,
        }
    }
}

/// Reads the last `capacity` commands from the history file of `shell`.
///
/// Returns an empty history for shells without a known history file or when
/// the file cannot be read.
pub fn load_shell_history(shell: &str, capacity: usize) -> CommandHistory {
    let Some(home) = dirs::home_dir() else {
        return CommandHistory::new(capacity);
    };
    match ShellKind::from_shell_path(shell).history_file(&home) {
        Some(path) => read_history_file(&path, capacity),
        None => CommandHistory::new(capacity),
    }
}

pub fn read_history_file(path: &Path, capacity: usize) -> CommandHistory {
    match std::fs::read(path) {
        Ok(bytes) => {
            let content = String::from_utf8_lossy(&bytes);
            let history = parse_history(&content, capacity);
            debug!(path = %path.display(), entries = history.len(), "seeded command history");
            history
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read shell history");
            CommandHistory::new(capacity)
        }
    }
}

/// Parses bash or zsh history content, stripping zsh extended-history metadata.
///
/// Every line goes through the dedup rule, so a file full of repeats still
/// seeds up to `capacity` distinct commands, newest last.
pub fn parse_history(content: &str, capacity: usize) -> CommandHistory {
    let commands = content
        .lines()
        .map(|line| strip_zsh_metadata(line).trim())
        .filter(|line| !line.is_empty());
    CommandHistory::with_entries(capacity, commands)
}

/// `: 1677887690:0;ls -la` -> `ls -la`
fn strip_zsh_metadata(line: &str) -> &str {
    let Some(rest) = line.strip_prefix(": ") else {
        return line;
    };
    let Some((meta, command)) = rest.split_once(';') else {
        return line;
    };
    let mut parts = meta.splitn(2, ':');
    let is_meta = matches!(
        (parts.next(), parts.next()),
        (Some(ts), Some(elapsed))
            if !ts.is_empty()
                && ts.bytes().all(|b| b.is_ascii_digit())
                && !elapsed.is_empty()
                && elapsed.bytes().all(|b| b.is_ascii_digit())
    );
    if is_meta {
        command
    } else {
        line
    }
}
