//! `Cache-Control` directive parsing.
//!
//! A header value such as `max-age=60, private="Set-Cookie", no-transform`
//! becomes an ordered list of directives, each with zero or more values.
//! Names are matched case-insensitively and stored lower-cased. When a
//! directive appears more than once, the first occurrence is kept.

use std::fmt;
use std::time::Duration;

use super::error::DirectiveError;

/// A parsed `Cache-Control` header.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keepsake::cache::DirectiveSet;
///
/// let cc = DirectiveSet::parse(r#"Max-Age=60, no-cache="Set-Cookie, X-Token""#).unwrap();
/// assert!(cc.has("max-age"));
/// assert_eq!(cc.duration("max-age").unwrap(), Duration::from_secs(60));
/// assert_eq!(cc.values("no-cache"), &["Set-Cookie", "X-Token"]);
/// assert_eq!(cc.to_string(), r#"max-age=60, no-cache="Set-Cookie, X-Token""#);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveSet {
    directives: Vec<(String, Vec<String>)>,
}

impl DirectiveSet {
    /// Parses a comma-separated directive list.
    ///
    /// An empty input yields an empty set.
    ///
    /// # Errors
    ///
    /// [`DirectiveError::Malformed`] on an unterminated quoted string or a
    /// value with no directive name in front of it.
    pub fn parse(input: &str) -> Result<Self, DirectiveError> {
        let mut set = Self::default();
        let bytes = input.as_bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            pos = skip(bytes, pos, |b| is_space(b) || b == b',');
            if pos >= bytes.len() {
                break;
            }

            let start = pos;
            pos = skip(bytes, pos, |b| !is_delimiter(b));
            if pos == start {
                return Err(malformed(input, pos));
            }
            let name = input[start..pos].to_ascii_lowercase();

            pos = skip(bytes, pos, is_space);
            let mut values = Vec::new();
            if bytes.get(pos) == Some(&b'=') {
                pos = skip(bytes, pos + 1, is_space);
                if bytes.get(pos) == Some(&b'"') {
                    let (quoted, next) = quoted_string(input, pos)?;
                    values.extend(
                        quoted
                            .split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty())
                            .map(str::to_owned),
                    );
                    pos = next;
                } else {
                    let value_start = pos;
                    pos = skip(bytes, pos, |b| !is_delimiter(b));
                    values.push(input[value_start..pos].to_owned());
                }
            }

            pos = skip(bytes, pos, is_space);
            match bytes.get(pos) {
                None | Some(b',') => {}
                Some(_) => return Err(malformed(input, pos)),
            }

            if !set.has(&name) {
                set.directives.push((name, values));
            }
        }

        Ok(set)
    }

    /// Returns `true` if the directive is present.
    pub fn has(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Returns the first value of a directive, `Some("")` for a valueless one,
    /// or `None` when absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .map(|values| values.first().map_or("", String::as_str))
    }

    /// Returns every value of a directive (empty when absent or valueless).
    pub fn values(&self, name: &str) -> &[String] {
        self.entry(name).unwrap_or(&[])
    }

    /// Reads a directive as a whole number of seconds.
    ///
    /// # Errors
    ///
    /// [`DirectiveError::Missing`] when absent, [`DirectiveError::NotANumber`]
    /// when the value is not a non-negative integer.
    pub fn duration(&self, name: &str) -> Result<Duration, DirectiveError> {
        let value = self
            .get(name)
            .ok_or_else(|| DirectiveError::Missing(name.to_owned()))?;
        value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| DirectiveError::NotANumber {
                name: name.to_owned(),
                value: value.to_owned(),
            })
    }

    /// Number of distinct directives.
    pub fn len(&self) -> usize {
        self.directives.len()
    }

    /// Returns `true` when no directives were parsed.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    fn entry(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

impl fmt::Display for DirectiveSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, values)) in self.directives.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            match values.as_slice() {
                [] => {}
                [single] if !single.is_empty() && !single.bytes().any(is_delimiter) => {
                    write!(f, "={single}")?;
                }
                many => write!(f, "=\"{}\"", many.join(", "))?,
            }
        }
        Ok(())
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_delimiter(b: u8) -> bool {
    is_space(b) || matches!(b, b',' | b'=' | b'"')
}

fn skip(bytes: &[u8], mut pos: usize, pred: impl Fn(u8) -> bool) -> usize {
    while pos < bytes.len() && pred(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn malformed(input: &str, position: usize) -> DirectiveError {
    DirectiveError::Malformed {
        input: input.to_owned(),
        position,
    }
}

// `open` indexes the opening quote. Returns the unescaped contents and the
// index just past the closing quote.
fn quoted_string(input: &str, open: usize) -> Result<(String, usize), DirectiveError> {
    let mut out = String::new();
    let mut chars = input[open + 1..].char_indices();
    while let Some((offset, c)) = chars.next() {
        match c {
            '"' => return Ok((out, open + 1 + offset + 1)),
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            other => out.push(other),
        }
    }
    Err(malformed(input, open))
}
