//! SMTP verb handlers and the verb routing map.
//!
//! Each verb is a small state transition over the per-connection
//! [`Session`]: handlers validate sequencing and arguments, mutate the
//! session, and return the reply to send. All socket I/O stays in the
//! connection engine, so handlers are plain synchronous code.

use crate::connection::Session;
use crate::protocol::{parse_path, Reply};
use std::collections::HashMap;
use std::sync::Arc;

/// A command handler for one verb keyword.
pub trait Verb: Send + Sync {
    /// Process one command line addressed to this verb.
    fn process(&self, session: &mut Session, args: &str) -> Reply;
}

/// Routing map from verb keyword to its handler.
///
/// Keywords are compared case-insensitively. The map is built once per
/// server start and shared immutably by every connection of that run.
pub struct VerbMap {
    verbs: HashMap<String, Arc<dyn Verb>>,
}

impl VerbMap {
    pub fn new() -> Self {
        VerbMap {
            verbs: HashMap::new(),
        }
    }

    /// Build the map with the full set of supported verbs.
    pub fn builtin() -> Self {
        let mut map = VerbMap::new();
        map.set("HELO", Arc::new(Helo));
        map.set("EHLO", Arc::new(Ehlo));
        map.set("MAIL", Arc::new(Mail));
        map.set("RCPT", Arc::new(Rcpt));
        map.set("DATA", Arc::new(Data));
        map.set("RSET", Arc::new(Rset));
        map.set("NOOP", Arc::new(Noop));
        map.set("QUIT", Arc::new(Quit));
        map
    }

    /// Register or overwrite the handler for a keyword.
    pub fn set(&mut self, keyword: &str, verb: Arc<dyn Verb>) {
        self.verbs.insert(keyword.to_ascii_uppercase(), verb);
    }

    /// Look up the handler for a keyword.
    ///
    /// Absence is not an error here; the connection engine answers 500
    /// for keywords it cannot route.
    pub fn get(&self, keyword: &str) -> Option<Arc<dyn Verb>> {
        self.verbs.get(&keyword.to_ascii_uppercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.verbs.len()
    }
}

impl Default for VerbMap {
    fn default() -> Self {
        VerbMap::new()
    }
}

/// HELO: record the client name and reset any in-progress envelope
pub struct Helo;

impl Verb for Helo {
    fn process(&self, session: &mut Session, args: &str) -> Reply {
        if args.is_empty() {
            return Reply::syntax_error("HELO requires a domain address");
        }

        session.client_name = Some(args.to_string());
        session.reset_envelope();
        Reply::ok(format!("{} Hello {}", session.hostname, args))
    }
}

/// EHLO: HELO plus an extension listing in the multi-line reply
pub struct Ehlo;

impl Verb for Ehlo {
    fn process(&self, session: &mut Session, args: &str) -> Reply {
        if args.is_empty() {
            return Reply::syntax_error("EHLO requires a domain address");
        }

        session.client_name = Some(args.to_string());
        session.reset_envelope();
        Reply::with_lines(
            250,
            vec![
                format!("{} Hello {}", session.hostname, args),
                "8BITMIME".to_string(),
            ],
        )
    }
}

/// MAIL: open an envelope by recording the reverse-path
pub struct Mail;

impl Verb for Mail {
    fn process(&self, session: &mut Session, args: &str) -> Reply {
        if session.reverse_path.is_some() {
            return Reply::bad_sequence("Sender already specified");
        }

        match parse_path(args, "FROM:") {
            Some(path) => {
                session.reverse_path = Some(path);
                Reply::ok("OK")
            }
            None => Reply::syntax_error("Syntax: MAIL FROM:<address>"),
        }
    }
}

/// RCPT: add a forward-path to the open envelope
pub struct Rcpt;

impl Verb for Rcpt {
    fn process(&self, session: &mut Session, args: &str) -> Reply {
        if session.reverse_path.is_none() {
            return Reply::bad_sequence("Need MAIL command first");
        }

        match parse_path(args, "TO:") {
            Some(path) if !path.is_empty() => {
                session.forward_paths.push(path);
                Reply::ok("OK")
            }
            _ => Reply::syntax_error("Syntax: RCPT TO:<address>"),
        }
    }
}

/// DATA: switch the connection into message data collection
pub struct Data;

impl Verb for Data {
    fn process(&self, session: &mut Session, args: &str) -> Reply {
        if !args.is_empty() {
            return Reply::syntax_error("DATA takes no arguments");
        }
        if session.forward_paths.is_empty() {
            return Reply::bad_sequence("Need RCPT command first");
        }

        session.collecting_data = true;
        Reply::start_mail_input()
    }
}

/// RSET: abandon the in-progress envelope, keep the client identity
pub struct Rset;

impl Verb for Rset {
    fn process(&self, session: &mut Session, _args: &str) -> Reply {
        session.reset_envelope();
        Reply::ok("OK")
    }
}

/// NOOP: do nothing, successfully
pub struct Noop;

impl Verb for Noop {
    fn process(&self, _session: &mut Session, _args: &str) -> Reply {
        Reply::ok("OK")
    }
}

/// QUIT: say goodbye and flag the session for close
pub struct Quit;

impl Verb for Quit {
    fn process(&self, session: &mut Session, _args: &str) -> Reply {
        session.quitting = true;
        Reply::closing_channel(&session.hostname)
    }
}
