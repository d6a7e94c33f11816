//! Line parser for the image command language
//!
//! One command per line:
//!
//! ```text
//! ls
//! import SRC DST
//! export SRC DST
//! rm PATH
//! cat PATH
//! info
//! # comment
//! ```

use std::fmt;

/// Longest accepted command line, excluding the line terminator
pub const MAX_LINE_LEN: usize = 127;

/// One parsed line. Borrows from the line it was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    List,
    Import { src: &'a str, dst: &'a str },
    Export { src: &'a str, dst: &'a str },
    Remove(&'a str),
    Cat(&'a str),
    Info,
    /// Empty line or comment
    Blank,
    SyntaxError(&'a str),
}

impl<'a> Command<'a> {
    /// Parse a single line. Keywords are case sensitive.
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Command::Blank;
        }
        if line.len() > MAX_LINE_LEN {
            return Command::SyntaxError(line);
        }

        let (keyword, rest) = match line.find(char::is_whitespace) {
            Some(idx) => (&line[..idx], line[idx..].trim()),
            None => (line, ""),
        };

        match keyword {
            "ls" if rest.is_empty() => Command::List,
            // Anything after `info` is ignored
            "info" => Command::Info,
            "import" => match two_args(rest) {
                Some((src, dst)) => Command::Import { src, dst },
                None => Command::SyntaxError(line),
            },
            "export" => match two_args(rest) {
                Some((src, dst)) => Command::Export { src, dst },
                None => Command::SyntaxError(line),
            },
            "rm" if !rest.is_empty() => Command::Remove(rest),
            "cat" if !rest.is_empty() => Command::Cat(rest),
            _ => Command::SyntaxError(line),
        }
    }
}

fn two_args(rest: &str) -> Option<(&str, &str)> {
    let mut tokens = rest.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(a), Some(b), None) => Some((a, b)),
        _ => None,
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => write!(f, "ls"),
            Command::Import { src, dst } => write!(f, "import {} {}", src, dst),
            Command::Export { src, dst } => write!(f, "export {} {}", src, dst),
            Command::Remove(path) => write!(f, "rm {}", path),
            Command::Cat(path) => write!(f, "cat {}", path),
            Command::Info => write!(f, "info"),
            Command::Blank => Ok(()),
            Command::SyntaxError(line) => write!(f, "{}", line),
        }
    }
}
