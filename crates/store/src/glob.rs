//! `MATCH`-style glob patterns compiled to regular expressions.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[^a]`, `[a-z]`) and
//! backslash escapes. An unterminated `[` is matched literally.

use regex::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&glob_to_regex(pattern))?,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Translate a glob into an anchored regex source string.
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^(?s:");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars.get(j) == Some(&'^') {
                        out.push('^');
                        j += 1;
                    }
                    while j < end {
                        match chars[j] {
                            '\\' if j + 1 < end => {
                                j += 1;
                                out.push_str(&regex::escape(&chars[j].to_string()));
                            }
                            '-' => out.push('-'),
                            c => out.push_str(&regex::escape(&c.to_string())),
                        }
                        j += 1;
                    }
                    out.push(']');
                    i = end;
                }
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push_str(")$");
    out
}

/// Index of the `]` closing the class opened at `start`, skipping escapes.
/// Empty classes (`[]`) are not recognised.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'^') {
        j += 1;
    }
    let first = j;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            ']' if j > first => return Some(j),
            _ => j += 1,
        }
    }
    None
}
