//! Tab-completion over a [`CommandRegistry`].
//!
//! Cursor positions are counted in characters, not bytes.

use super::CommandRegistry;

/// The key that triggers completion.
pub const COMPLETION_KEY: char = '\t';

/// What the line editor should do after a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub line: String,
    pub pos: usize,
    /// `true` when the key press was consumed, even if the line is unchanged.
    pub handled: bool,
}

impl Completion {
    fn unhandled(line: &str, pos: usize) -> Self {
        Self {
            line: line.to_string(),
            pos,
            handled: false,
        }
    }

    fn unchanged(line: &str, pos: usize) -> Self {
        Self {
            line: line.to_string(),
            pos,
            handled: true,
        }
    }

    fn replaced(line: String) -> Self {
        let pos = line.chars().count();
        Self {
            line,
            pos,
            handled: true,
        }
    }
}

/// Complete `line` for a key press at cursor `pos`.
///
/// Only a [`COMPLETION_KEY`] press with the cursor at end of line does
/// anything. A line without whitespace completes the command name; otherwise
/// the last word is completed against the resolved command's candidates.
/// Several matching candidates consume the key but leave the line alone.
pub fn complete(registry: &CommandRegistry, line: &str, pos: usize, key: char) -> Completion {
    if key != COMPLETION_KEY || pos != line.chars().count() {
        return Completion::unhandled(line, pos);
    }

    let mut fields = line.split_whitespace();
    let first = fields.next().unwrap_or("");

    if !line.contains(char::is_whitespace) {
        return match registry.lookup(line) {
            Some((name, _)) => Completion::replaced(name),
            None => Completion::unhandled(line, pos),
        };
    }

    let Some((_, command)) = registry.lookup(first) else {
        return Completion::unhandled(line, pos);
    };
    let Some(candidates) = command.complete() else {
        return Completion::unhandled(line, pos);
    };

    if line.ends_with(char::is_whitespace) {
        return Completion::unchanged(line, pos);
    }

    let Some(so_far) = trailing_word(line) else {
        return Completion::unchanged(line, line.chars().count());
    };

    let mut matches = candidates
        .iter()
        .filter(|candidate| has_prefix_ignore_case(candidate, so_far));
    let Some(only) = matches.next() else {
        return Completion::unhandled(line, pos);
    };
    if matches.next().is_some() {
        return Completion::unchanged(line, pos);
    }

    let mut completed = line[..line.len() - so_far.len()].to_string();
    completed.push_str(only);
    Completion::replaced(completed)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// The run of word characters ending the line, provided it is preceded by a
/// non-word separator that is not the first character of the line.
fn trailing_word(line: &str) -> Option<&str> {
    let (sep_idx, sep) = line.char_indices().rev().find(|&(_, c)| !is_word_char(c))?;
    let start = sep_idx + sep.len_utf8();
    if sep_idx == 0 || start == line.len() {
        return None;
    }
    Some(&line[start..])
}

fn has_prefix_ignore_case(candidate: &str, prefix: &str) -> bool {
    candidate
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
