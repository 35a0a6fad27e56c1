//! Minimal STOMP 1.2 framing: a command line, `key:value` header lines, a
//! blank line, the body and a terminating NUL.

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let mut frame = String::with_capacity(self.command.len() + self.body.len() + 32);
        frame.push_str(&self.command);
        frame.push('\n');
        for (key, value) in &self.headers {
            let _ = writeln!(frame, "{key}:{value}");
        }
        frame.push('\n');
        frame.push_str(&self.body);
        frame.push('\0');
        frame
    }

    /// Parses one frame. Heart-beat newlines before the command are skipped.
    /// Returns `None` when the text holds no command.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_start_matches(['\n', '\r']);
        let (head, body) = match text.split_once("\n\n") {
            Some((head, body)) => (head, body),
            None => (text, ""),
        };

        let mut lines = head.lines();
        let command = lines.next()?.trim_end_matches('\r').trim();
        if command.is_empty() {
            return None;
        }
        let headers = lines
            .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let body = body.split('\0').next().unwrap_or_default().to_string();

        Some(Self {
            command: command.to_string(),
            headers,
            body,
        })
    }
}
