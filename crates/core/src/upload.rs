//! Command-line tokenizer for upload payloads.
//!
//! Each upload entry is one command in the familiar CLI syntax:
//! whitespace-separated arguments, double-quoted strings with backslash
//! escapes (`\"`, `\\`, `\n`, `\r`, `\t`) and single-quoted literals (only
//! `\'` is an escape). A closing quote must be followed by whitespace or the
//! end of the line.

use crate::error::CoreError;

/// Split a command line into its arguments.
///
/// Returns an empty vector for blank lines.
pub fn parse_command_line(line: &str) -> Result<Vec<String>, CoreError> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        match first {
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        None => return Err(unbalanced(line)),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => arg.push('\n'),
                            Some('r') => arg.push('\r'),
                            Some('t') => arg.push('\t'),
                            Some(other) => arg.push(other),
                            None => return Err(unbalanced(line)),
                        },
                        Some(c) => arg.push(c),
                    }
                }
                ensure_separated(chars.peek(), line)?;
            }
            '\'' => {
                chars.next();
                loop {
                    match chars.next() {
                        None => return Err(unbalanced(line)),
                        Some('\'') => break,
                        Some('\\') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            arg.push('\'');
                        }
                        Some(c) => arg.push(c),
                    }
                }
                ensure_separated(chars.peek(), line)?;
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    arg.push(c);
                    chars.next();
                }
            }
        }
        args.push(arg);
    }

    Ok(args)
}

fn ensure_separated(next: Option<&char>, line: &str) -> Result<(), CoreError> {
    match next {
        None => Ok(()),
        Some(c) if c.is_whitespace() => Ok(()),
        Some(_) => Err(CoreError::Validation(format!(
            "closing quote must be followed by a space: {line}"
        ))),
    }
}

fn unbalanced(line: &str) -> CoreError {
    CoreError::Validation(format!("unbalanced quotes in command: {line}"))
}
