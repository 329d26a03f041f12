//! Lazy input sequences.
//!
//! The engine consumes any `Iterator<Item = Result<Item, InputError>>`. A
//! [`InputError::Malformed`] element is one bad record: the engine records it
//! as a failure and keeps pulling. [`InputError::Unreadable`] means the source
//! itself broke; the engine stops the run with [`Error::Input`].

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::Item;

/// An input element that did not yield an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// One record could not be parsed. Later records are still usable.
    Malformed(String),
    /// Reading the source failed. Nothing after this point can be trusted.
    Unreadable(String),
}

impl InputError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn unreadable(message: impl Into<String>) -> Self {
        Self::Unreadable(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Malformed(message) | Self::Unreadable(message) => message,
        }
    }

    /// Whether the whole sequence is unusable, not just this record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreadable(_))
    }
}

impl std::fmt::Display for InputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for InputError {}

/// Items read one line at a time from a JSON Lines file.
///
/// Each line is `{"id": "...", "prompt": "..." | [{"role", "content"}...], "input": {...}}`.
/// Blank lines are ignored. A read error is yielded once as
/// [`InputError::Unreadable`] and ends the sequence.
pub struct JsonlItems<R> {
    lines: Lines<R>,
    line_no: usize,
    broken: bool,
}

impl JsonlItems<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Input(format!("cannot read {}: {e}", path.display())))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonlItems<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            broken: false,
        }
    }
}

impl<R: BufRead> Iterator for JsonlItems<R> {
    type Item = std::result::Result<Item, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.broken {
            return None;
        }
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.broken = true;
                    return Some(Err(InputError::unreadable(format!(
                        "line {}: read failed: {e}",
                        self.line_no
                    ))));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<Item>(&line)
                    .map_err(|e| InputError::malformed(format!("line {}: {e}", self.line_no))),
            );
        }
    }
}
