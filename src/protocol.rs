//! SMTP command line parsing and reply generation.
//!
//! Splits client command lines into a verb keyword and its argument text,
//! and renders numeric replies (single- or multi-line) back to the wire.
//! Verb dispatch itself lives in the verb map; this module only handles
//! the line-level surface shared by the connection engine and the verbs.

use bytes::BytesMut;

/// A single client command line, split into keyword and argument text.
///
/// The verb keyword is normalized to ASCII uppercase so lookups in the
/// verb map are case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    /// Command keyword, uppercased (e.g. "MAIL")
    pub verb: String,
    /// Remainder of the line after the keyword, leading whitespace trimmed
    pub args: String,
}

impl CommandLine {
    /// Parse a trimmed command line. Returns `None` for an empty line.
    pub fn parse(line: &str) -> Option<CommandLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => Some(CommandLine {
                verb: verb.to_ascii_uppercase(),
                args: rest.trim_start().to_string(),
            }),
            None => Some(CommandLine {
                verb: line.to_ascii_uppercase(),
                args: String::new(),
            }),
        }
    }
}

/// An SMTP reply: a three-digit code and one or more text lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Single-line reply
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![text.into()],
        }
    }

    /// Multi-line reply (rendered with the `nnn-` continuation form)
    pub fn with_lines(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Reply { code, lines }
    }

    /// 220: greeting banner sent when a connection is accepted
    pub fn service_ready(hostname: &str) -> Self {
        Reply::new(220, format!("{hostname} ESMTP mailroom service ready"))
    }

    /// 221: goodbye, sent in response to QUIT
    pub fn closing_channel(hostname: &str) -> Self {
        Reply::new(221, format!("{hostname} closing transmission channel"))
    }

    /// 250: generic success
    pub fn ok(text: impl Into<String>) -> Self {
        Reply::new(250, text)
    }

    /// 354: client may start sending message data
    pub fn start_mail_input() -> Self {
        Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    /// 421: service shutting down, connection will be closed
    pub fn shutting_down(hostname: &str) -> Self {
        Reply::new(421, format!("{hostname} service closing transmission channel"))
    }

    /// 500: unknown command keyword
    pub fn unrecognized() -> Self {
        Reply::new(500, "Syntax error, command unrecognized")
    }

    /// 500: command line exceeded the configured length limit
    pub fn line_too_long() -> Self {
        Reply::new(500, "Line too long")
    }

    /// 501: keyword recognized but the arguments are malformed
    pub fn syntax_error(text: impl Into<String>) -> Self {
        Reply::new(501, text)
    }

    /// 503: command valid but not in this session state
    pub fn bad_sequence(text: impl Into<String>) -> Self {
        Reply::new(503, text)
    }

    /// Render the reply with CRLF line endings.
    ///
    /// Multi-line replies use the continuation form: every line but the
    /// last is `nnn-text`, the last is `nnn text`.
    pub fn render(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.lines.len() * 64);
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.extend_from_slice(format!("{}{}{}\r\n", self.code, sep, line).as_bytes());
        }
        out
    }
}

/// Extract the mailbox path from a `MAIL FROM:`/`RCPT TO:` argument.
///
/// `prefix` is matched case-insensitively ("FROM:" or "TO:"); the path
/// must be enclosed in angle brackets. The returned path may be empty
/// (the null reverse-path `<>`). Address grammar beyond the bracket
/// framing is not validated at this layer.
pub fn parse_path(args: &str, prefix: &str) -> Option<String> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let rest = args[prefix.len()..].trim();
    let inner = rest.strip_prefix('<')?.strip_suffix('>')?;
    Some(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_verb() {
        let cmd = CommandLine::parse("QUIT").unwrap();
        assert_eq!(cmd.verb, "QUIT");
        assert_eq!(cmd.args, "");
    }

    #[test]
    fn test_parse_verb_with_args() {
        let cmd = CommandLine::parse("MAIL FROM:<alice@example.org>").unwrap();
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.args, "FROM:<alice@example.org>");
    }

    #[test]
    fn test_parse_uppercases_verb() {
        let cmd = CommandLine::parse("helo client.example.org").unwrap();
        assert_eq!(cmd.verb, "HELO");
        assert_eq!(cmd.args, "client.example.org");
    }

    #[test]
    fn test_parse_empty_line() {
        assert!(CommandLine::parse("").is_none());
        assert!(CommandLine::parse("   ").is_none());
    }

    #[test]
    fn test_render_single_line() {
        let reply = Reply::ok("OK");
        assert_eq!(&reply.render()[..], b"250 OK\r\n");
    }

    #[test]
    fn test_render_multi_line() {
        let reply = Reply::with_lines(250, vec!["mail.example.com".into(), "8BITMIME".into()]);
        assert_eq!(&reply.render()[..], b"250-mail.example.com\r\n250 8BITMIME\r\n");
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("FROM:<alice@example.org>", "FROM:"),
            Some("alice@example.org".to_string())
        );
        assert_eq!(
            parse_path("from: <bob@example.org>", "FROM:"),
            Some("bob@example.org".to_string())
        );
        // Null reverse-path is legal
        assert_eq!(parse_path("FROM:<>", "FROM:"), Some(String::new()));
    }

    #[test]
    fn test_parse_path_rejects_malformed() {
        assert!(parse_path("alice@example.org", "FROM:").is_none());
        assert!(parse_path("FROM:alice@example.org", "FROM:").is_none());
        assert!(parse_path("TO:<carol@example.org>", "FROM:").is_none());
        assert!(parse_path("", "FROM:").is_none());
    }
}
