//! Protocol message parsing and formatting.
//!
//! This module handles the low-level framing of Tor's control port: reply
//! lines, data blocks, reply assembly from a byte stream, and command
//! formatting. It holds no connection state, so everything here can be
//! exercised against in-memory buffers.

use crate::error::{ControlError, Result, StatusCode};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

/// A raw reply line from Tor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// The 3-digit status code.
    pub code: u16,
    /// The separator character: '-' for mid-reply, '+' for data, ' ' for end.
    pub separator: char,
    /// The text content of the line.
    pub text: String,
    /// Body of a '+' line, with dot-escapes removed and lines joined by '\n'.
    pub data: Option<String>,
}

impl ReplyLine {
    /// Parse a reply line from a string.
    pub fn parse(line: &str) -> Result<Self> {
        if line.len() < 4 {
            return Err(ControlError::ProtocolError(format!(
                "Reply line too short: '{}'",
                line
            )));
        }

        let code: u16 = line
            .get(..3)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| {
                ControlError::ProtocolError(format!("Invalid status code in: '{}'", line))
            })?;

        let separator = line.chars().nth(3).ok_or_else(|| {
            ControlError::ProtocolError(format!("Missing separator in: '{}'", line))
        })?;

        if !matches!(separator, ' ' | '-' | '+') {
            return Err(ControlError::ProtocolError(format!(
                "Invalid separator '{}' in: '{}'",
                separator, line
            )));
        }

        let text = line.get(4..).unwrap_or_default().to_string();

        Ok(ReplyLine {
            code,
            separator,
            text,
            data: None,
        })
    }

    /// Check if this is the final line of a reply.
    pub fn is_end(&self) -> bool {
        self.separator == ' '
    }

    /// Check if this line opens a data block.
    pub fn is_data(&self) -> bool {
        self.separator == '+'
    }
}

/// A complete reply from Tor, potentially spanning multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The status code of the final line.
    pub code: u16,
    /// All reply lines.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Create a new Reply from a list of reply lines.
    pub fn new(lines: Vec<ReplyLine>) -> Result<Self> {
        let code = lines
            .last()
            .map(|line| line.code)
            .ok_or_else(|| ControlError::ProtocolError("Empty reply".to_string()))?;

        Ok(Reply { code, lines })
    }

    /// Get the status code as an enum.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code)
    }

    /// Check if this reply indicates success.
    pub fn is_success(&self) -> bool {
        self.status_code().is_success()
    }

    /// Get all text lines concatenated.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Convert this reply into a Result, returning an error if the reply indicates failure.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ControlError::CommandRejected {
                code: self.code,
                message: self.text(),
            })
        }
    }

    /// Collect the `key=value` pairs carried by this reply.
    ///
    /// `250-key=value` lines contribute one pair each, `250+key=` lines
    /// contribute their data block as the value. Lines without `=` (such as
    /// the closing `250 OK`) are skipped.
    pub fn pairs(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();

        for line in &self.lines {
            let Some((key, value)) = line.text.split_once('=') else {
                continue;
            };

            let value = match &line.data {
                Some(data) => data.clone(),
                None => value.to_string(),
            };

            result.insert(key.to_string(), value);
        }

        result
    }
}

/// Read one complete reply from `reader`.
///
/// Consumes lines until a line with the ' ' separator arrives. A '+' line
/// pulls in the following data block up to the lone "." terminator. End of
/// stream before the reply is complete is reported as
/// [`ControlError::ConnectionClosed`].
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ControlError::ConnectionClosed);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        trace!("Received line: {}", trimmed);

        let mut reply_line = ReplyLine::parse(trimmed)?;
        let is_end = reply_line.is_end();

        if reply_line.is_data() {
            reply_line.data = Some(read_data_block(reader).await?);
        }

        lines.push(reply_line);

        if is_end {
            break;
        }
    }

    Reply::new(lines)
}

async fn read_data_block<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut data_lines = Vec::new();
    let mut data_line = String::new();

    loop {
        data_line.clear();
        if reader.read_line(&mut data_line).await? == 0 {
            return Err(ControlError::ConnectionClosed);
        }

        let trimmed = data_line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            break;
        }

        data_lines.push(unescape_dot(trimmed).to_string());
    }

    Ok(data_lines.join("\n"))
}

fn unescape_dot(line: &str) -> &str {
    if line.starts_with("..") {
        &line[1..]
    } else {
        line
    }
}

/// Quote a string for use as a control-port QuotedString.
///
/// Unlike configuration values, secrets are always sent quoted, so an
/// empty or plain-ASCII secret still becomes `"..."`.
pub fn quote_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');

    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            _ => result.push(c),
        }
    }

    result.push('"');
    result
}

/// Format a command with arguments.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str("\r\n");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    const GETINFO_REPLY: &str = "250-version=0.4.8.12\r\n\
        250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n\
        250+circuit-status=\r\n\
        1 BUILT $AAAA~relay1,$BBBB~relay2 PURPOSE=GENERAL\r\n\
        ..dotted\r\n\
        .\r\n\
        250 OK\r\n";

    async fn parse(bytes: &str) -> Result<Reply> {
        let mut reader = bytes.as_bytes();
        read_reply(&mut reader).await
    }

    #[test]
    fn test_reply_line_parsing() {
        let line = ReplyLine::parse("250 OK").unwrap();
        assert_eq!(line.code, 250);
        assert_eq!(line.separator, ' ');
        assert_eq!(line.text, "OK");
        assert!(line.is_end());

        let mid = ReplyLine::parse("250-version=0.4.8.10").unwrap();
        assert_eq!(mid.separator, '-');
        assert!(!mid.is_end());

        let data = ReplyLine::parse("250+circuit-status=").unwrap();
        assert!(data.is_data());
    }

    #[test]
    fn test_reply_line_too_short() {
        assert!(ReplyLine::parse("25").is_err());
        assert!(ReplyLine::parse("").is_err());
    }

    #[test]
    fn test_reply_line_invalid_code() {
        assert!(ReplyLine::parse("ABC OK").is_err());
    }

    #[test]
    fn test_reply_line_invalid_separator() {
        assert!(ReplyLine::parse("250/OK").is_err());
    }

    #[test]
    fn test_reply_line_minimal() {
        let line = ReplyLine::parse("250 ").unwrap();
        assert_eq!(line.code, 250);
        assert!(line.text.is_empty());
    }

    #[test]
    fn test_reply_new_empty() {
        assert!(Reply::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_read_reply_pairs_and_data_block() {
        let reply = parse(GETINFO_REPLY).await.unwrap();
        assert!(reply.is_success());

        let pairs = reply.pairs();
        assert_eq!(pairs.get("version").map(String::as_str), Some("0.4.8.12"));
        assert_eq!(
            pairs.get("status/bootstrap-phase").map(String::as_str),
            Some("NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"")
        );
        assert_eq!(
            pairs.get("circuit-status").map(String::as_str),
            Some("1 BUILT $AAAA~relay1,$BBBB~relay2 PURPOSE=GENERAL\n.dotted")
        );
        assert_eq!(pairs.len(), 3);
    }

    #[tokio::test]
    async fn test_read_reply_is_deterministic() {
        let first = parse(GETINFO_REPLY).await.unwrap();
        let second = parse(GETINFO_REPLY).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.pairs(), second.pairs());
    }

    #[tokio::test]
    async fn test_read_reply_empty_data_block() {
        let reply = parse("250+circuit-status=\r\n.\r\n250 OK\r\n").await.unwrap();
        assert_eq!(
            reply.pairs().get("circuit-status").map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_read_reply_rejection() {
        let reply = parse("552 Unrecognized key \"bogus\"\r\n").await.unwrap();
        assert!(!reply.is_success());
        match reply.into_result() {
            Err(ControlError::CommandRejected { code, message }) => {
                assert_eq!(code, 552);
                assert!(message.contains("bogus"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_reply_stops_at_end_line() {
        let mut reader = "250 OK\r\n250 OK\r\n".as_bytes();
        read_reply(&mut reader).await.unwrap();
        assert_eq!(reader, b"250 OK\r\n");
    }

    #[tokio::test]
    async fn test_read_reply_truncated() {
        assert!(matches!(
            parse("250-version=0.4.8.12\r\n").await,
            Err(ControlError::ConnectionClosed)
        ));
        assert!(matches!(
            parse("250+circuit-status=\r\n1 BUILT\r\n").await,
            Err(ControlError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_reply_garbage() {
        assert!(matches!(
            parse("hello\r\n").await,
            Err(ControlError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_string("simple"), "\"simple\"");
        assert_eq!(quote_string(""), "\"\"");
        assert_eq!(quote_string("with\"quote"), "\"with\\\"quote\"");
        assert_eq!(quote_string("back\\slash"), "\"back\\\\slash\"");
    }

    #[test]
    fn test_command_formatting() {
        let cmd = format_command("GETINFO", &["version", "traffic/read"]);
        assert_eq!(cmd, "GETINFO version traffic/read\r\n");
        assert_eq!(format_command("QUIT", &[]), "QUIT\r\n");
    }
}
