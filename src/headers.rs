//! Ordered, case-insensitive header container used for wire packets and
//! parsed event bodies.
//!
//! Entries keep their insertion order, including between entries that share
//! a name. Name comparison is ASCII case-insensitive; values are stored and
//! compared verbatim.

use std::borrow::Cow;
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{EslError, EslResult};

/// Characters percent-escaped in header values, following RFC 3986
/// path-segment rules. Names are never escaped.
const VALUE_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b',')
    .add(b'/')
    .add(b';')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    name: String,
    value: String,
}

impl Header {
    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A collection of headers in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any existing entries with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace every entry with the given name, appending the new value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.add(name, value);
    }

    /// First value for the given name, or the empty string when absent.
    /// Callers that need to distinguish "absent" from "empty value" can use
    /// [`get_all`](Self::get_all).
    pub fn get(&self, name: &str) -> &str {
        self.entries
            .iter()
            .find(|h| h.matches(name))
            .map(|h| h.value.as_str())
            .unwrap_or("")
    }

    /// Every value for the given name, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.matches(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Remove every entry with the given name, preserving the order of the
    /// survivors. The container is only rebuilt when at least one entry
    /// matched.
    pub fn remove(&mut self, name: &str) {
        if self.entries.iter().any(|h| h.matches(name)) {
            self.entries.retain(|h| !h.matches(name));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_str()))
    }

    /// Parse a MIME-style header block: one `Name: Value` per line, with
    /// optional `\r` line endings. When `unescape` is set, each value is
    /// percent-unescaped as it is stored (FreeSWITCH transmits event body
    /// header values percent-escaped; envelope headers arrive plain).
    pub fn parse(block: &str, unescape: bool) -> EslResult<Headers> {
        let mut headers = Headers::new();
        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| EslError::protocol(format!("malformed header line: {line:?}")))?;
            let value = value.trim();
            if unescape {
                headers.add(name.trim(), unescape_value(value));
            } else {
                headers.add(name.trim(), value);
            }
        }
        Ok(headers)
    }

    /// Headers in plain text form, e.g.:
    ///
    /// ```text
    /// Event-Date-Local: 2018-05-04 04:06:45
    /// Event-Sequence: 79878
    /// ```
    ///
    /// This is the [`Display`](fmt::Display) form; see
    /// [`to_escaped_string`](Self::to_escaped_string) for the wire form.
    fn write_plain(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for h in &self.entries {
            writeln!(f, "{}: {}", h.name, h.value)?;
        }
        Ok(())
    }

    /// Same as the `Display` form, but percent-escapes the value parts:
    ///
    /// ```text
    /// Event-Date-Local: 2018-05-04%2004:06:45
    /// Event-Sequence: 79878
    /// ```
    pub fn to_escaped_string(&self) -> String {
        let mut out = String::new();
        for h in &self.entries {
            out.push_str(&h.name);
            out.push_str(": ");
            out.push_str(&escape_value(&h.value));
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_plain(f)
    }
}

/// Percent-escape a header value for the wire.
pub(crate) fn escape_value(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, VALUE_ESCAPE).into()
}

/// Inverse of [`escape_value`]. Malformed input is kept verbatim rather
/// than dropped.
pub(crate) fn unescape_value(value: &str) -> String {
    match percent_decode_str(value).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => value.to_string(),
    }
}
