//! Command state tracked for every GET/SET sent to the server

use crate::config::ProtocolTokens;
use std::fmt;

/// Request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Set,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Set => "SET",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode type announced by a `!TYPE` tag line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Float,
    Text,
}

impl ValueType {
    /// Map a type tag value (0=none, 1=int, 2=float, 3=string)
    ///
    /// Tags 0 and 3 and anything unrecognized decode as text.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().trim_matches('"') {
            "1" => ValueType::Integer,
            "2" => ValueType::Float,
            _ => ValueType::Text,
        }
    }
}

/// A decoded inline value
#[derive(Debug, Clone, PartialEq)]
pub enum TplValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TplValue {
    /// Decode raw inline text using the command's current decode type
    ///
    /// The server quotes string values; quotes are stripped before decoding.
    /// No type tag seen yet means text.
    pub fn decode(raw: &str, value_type: Option<ValueType>) -> Result<Self, String> {
        let text = raw.trim().replace('"', "");
        match value_type.unwrap_or(ValueType::Text) {
            ValueType::Integer => text
                .parse::<i64>()
                .map(TplValue::Integer)
                .map_err(|e| format!("'{}' is not an integer: {}", text, e)),
            ValueType::Float => text
                .parse::<f64>()
                .map(TplValue::Float)
                .map_err(|e| format!("'{}' is not a float: {}", text, e)),
            ValueType::Text => Ok(TplValue::Text(text)),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TplValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TplValue::Integer(v) => Some(*v as f64),
            TplValue::Float(v) => Some(*v),
            TplValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TplValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for TplValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TplValue::Integer(v) => write!(f, "{}", v),
            TplValue::Float(v) => write!(f, "{}", v),
            TplValue::Text(v) => f.write_str(v),
        }
    }
}

/// An `EVENT ERROR` notification tied to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub target: String,
    pub message: String,
}

/// One protocol transaction and everything the server said about it
///
/// Fields are read through accessors; only the dispatcher mutates them, and
/// `complete` never goes back to false once set.
#[derive(Debug, Clone)]
pub struct Command {
    id: u64,
    verb: Verb,
    target: String,
    status: Option<String>,
    status_history: Vec<String>,
    ok: bool,
    complete: bool,
    value_type: Option<ValueType>,
    values: Vec<TplValue>,
    events: Vec<CommandEvent>,
    raw_lines: Vec<String>,
    decode_error: Option<String>,
}

/// Copy of a command handed out to callers
pub type CommandSnapshot = Command;

impl Command {
    pub(crate) fn new(id: u64, verb: Verb, target: &str) -> Self {
        Self {
            id,
            verb,
            target: target.to_string(),
            status: None,
            status_history: Vec::new(),
            ok: false,
            complete: false,
            value_type: None,
            values: Vec::new(),
            events: Vec::new(),
            raw_lines: Vec::new(),
            decode_error: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Last status token, `None` until the first status line
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn status_history(&self) -> &[String] {
        &self.status_history
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.value_type
    }

    pub fn values(&self) -> &[TplValue] {
        &self.values
    }

    pub fn events(&self) -> &[CommandEvent] {
        &self.events
    }

    pub fn raw_lines(&self) -> &[String] {
        &self.raw_lines
    }

    /// Decode failure that terminated this command, if any
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.decode_error.is_some()
    }

    /// Whether the last status equals the configured success token
    pub fn succeeded(&self, tokens: &ProtocolTokens) -> bool {
        self.status.as_deref() == Some(tokens.success.as_str())
    }

    pub(crate) fn record_raw(&mut self, line: &str) {
        self.raw_lines.push(line.to_string());
    }

    /// Returns true when this status completed the command
    pub(crate) fn record_status(&mut self, status: &str, tokens: &ProtocolTokens) -> bool {
        self.status = Some(status.to_string());
        self.status_history.push(status.to_string());
        if status == tokens.accepted {
            self.ok = true;
        }
        if status == tokens.finished && !self.complete {
            self.complete = true;
            return true;
        }
        false
    }

    pub(crate) fn set_value_type(&mut self, value_type: ValueType) {
        self.value_type = Some(value_type);
    }

    pub(crate) fn push_raw_value(&mut self, raw: &str) -> Result<(), String> {
        let value = TplValue::decode(raw, self.value_type)?;
        self.values.push(value);
        Ok(())
    }

    pub(crate) fn push_event(&mut self, target: &str, message: &str) {
        self.events.push(CommandEvent {
            target: target.to_string(),
            message: message.to_string(),
        });
    }

    /// Terminal failure: complete, not ok, never processed again
    pub(crate) fn mark_failed(&mut self, reason: String) {
        self.ok = false;
        self.complete = true;
        self.decode_error = Some(reason);
    }
}
