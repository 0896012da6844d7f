//! Redis-style glob matching for key listings

use globset::{GlobBuilder, GlobMatcher};
use kvshield_core::{KvError, Result};

/// Compile a Redis `KEYS`/`SCAN MATCH` pattern.
///
/// `*` spans any characters including the key delimiter, `?` matches one
/// character, `[...]` a class (`^` negates), and `\` escapes the next
/// character. Braces are literal, as in Redis.
pub(crate) fn compile(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(&translate(pattern))
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| KvError::Validation(format!("invalid key pattern {pattern:?}: {e}")))
}

/// Rewrite Redis glob syntax into globset syntax
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push('\\');
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            '{' | '}' if !in_class => {
                out.push('\\');
                out.push(c);
            }
            // Consecutive stars match the same as one.
            '*' if !in_class => {
                out.push('*');
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }
    out
}
