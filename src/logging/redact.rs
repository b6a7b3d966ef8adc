//! Secret scrubbing for structured log fields and free text.

use regex::Regex;
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::sync::LazyLock;
use tracing_subscriber::fmt::MakeWriter;

pub const REDACTED: &str = "[REDACTED]";
pub const TRUNCATED: &str = "[TRUNCATED]";

/// Nesting below this depth is replaced with [`TRUNCATED`].
pub const MAX_DEPTH: usize = 8;

/// Matched as substrings of the normalised key (lowercase, no `_` or `-`).
const SECRET_KEY_PARTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "session",
    "verifier",
    "authorization",
    "cookie",
    "apikey",
    "credential",
];

static RE_BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+").expect("failed to compile regex: bearer")
});

static RE_BASIC_AUTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbasic\s+[A-Za-z0-9+/]{8,}=*").expect("failed to compile regex: basic_auth")
});

static RE_FORM_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b([a-z_]*token|code_verifier|client_secret|code)=(?:"[^"]*"|[^&\s"',]+)"#)
        .expect("failed to compile regex: form_secret")
});

// SGR escapes split `key=value` apart when a formatter colours field names
static RE_ANSI_SGR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;]*m").expect("failed to compile regex: ansi_sgr")
});

static RE_JSON_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"([a-z_]*(?:token|secret|verifier|password))"\s*:\s*"[^"]*""#)
        .expect("failed to compile regex: json_secret")
});

/// True when `key` names a secret (`refresh_token`, `Client-Secret`, `sessionId`, ...).
pub fn is_secret_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase();
    SECRET_KEY_PARTS.iter().any(|part| normalized.contains(part))
}

/// Scrubs credentials out of free text (messages, error bodies, URLs).
pub fn redact_string(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let result = RE_BEARER.replace_all(input, "Bearer [REDACTED]");
    let result = RE_BASIC_AUTH.replace_all(&result, "Basic [REDACTED]");
    let result = RE_FORM_SECRET.replace_all(&result, "$1=[REDACTED]");
    let result = RE_JSON_SECRET.replace_all(&result, "\"$1\":\"[REDACTED]\"");
    result.into_owned()
}

/// Returns a redacted copy of `value`.
///
/// Values under secret keys become [`REDACTED`] unless they are booleans or
/// null; every remaining string goes through [`redact_string`].
pub fn redact_value(value: &Value) -> Value {
    redact_at(value, 0)
}

pub fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    redact_entries(map, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) if depth >= MAX_DEPTH => {
            Value::String(TRUNCATED.to_string())
        }
        Value::Object(map) => Value::Object(redact_entries(map, depth)),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_at(v, depth + 1)).collect()),
        Value::String(s) => Value::String(redact_string(s)),
        other => other.clone(),
    }
}

fn redact_entries(map: &Map<String, Value>, depth: usize) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let value = if is_secret_key(key) && !(value.is_boolean() || value.is_null()) {
                Value::String(REDACTED.to_string())
            } else {
                redact_at(value, depth + 1)
            };
            (key.clone(), value)
        })
        .collect()
}

/// Line-buffered writer that scrubs every complete line before passing it on.
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn write_redacted(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let plain = RE_ANSI_SGR.replace_all(&text, "");
        self.inner.write_all(redact_string(&plain).as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.write_redacted(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.write_redacted(&rest)?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Wraps a `MakeWriter` (stderr for the console layer) with [`RedactingWriter`].
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}
