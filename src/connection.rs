//! Per-connection SMTP engine.
//!
//! Reads command lines from one accepted client, routes them through the
//! verb map, and writes replies. The engine owns the session state and
//! the transport; verb handlers only see the [`Session`].

use crate::config::Config;
use crate::protocol::{CommandLine, Reply};
use crate::verbs::VerbMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Per-connection session state mutated by the verb handlers.
#[derive(Debug)]
pub struct Session {
    /// Hostname announced in replies
    pub hostname: String,
    /// Client name from HELO/EHLO
    pub client_name: Option<String>,
    /// Envelope sender; an empty string is the null reverse-path
    pub reverse_path: Option<String>,
    /// Envelope recipients
    pub forward_paths: Vec<String>,
    /// Set by DATA: subsequent lines are message data
    pub collecting_data: bool,
    /// Set by QUIT: close after the reply is written
    pub quitting: bool,
}

impl Session {
    pub fn new(hostname: String) -> Self {
        Session {
            hostname,
            client_name: None,
            reverse_path: None,
            forward_paths: Vec::new(),
            collecting_data: false,
            quitting: false,
        }
    }

    /// Abandon the in-progress envelope. The client identity from
    /// HELO/EHLO survives a reset.
    pub fn reset_envelope(&mut self) {
        self.reverse_path = None;
        self.forward_paths.clear();
        self.collecting_data = false;
    }
}

/// One client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    verbs: Arc<VerbMap>,
    config: Arc<Config>,
    close: CancellationToken,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        verbs: Arc<VerbMap>,
        config: Arc<Config>,
        close: CancellationToken,
    ) -> Self {
        Connection {
            stream,
            peer,
            verbs,
            config,
            close,
        }
    }

    /// Run the session to completion.
    ///
    /// Returns when the client disconnects, QUITs, or the server requests
    /// a close. Forced termination drops this future from outside.
    pub async fn process(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Connection {
            stream,
            peer,
            verbs,
            config,
            close,
        } = self;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut session = Session::new(config.hostname.clone());
        let mut data: Vec<u8> = Vec::new();
        let mut line = String::with_capacity(config.max_line_length);

        writer
            .write_all(&Reply::service_ready(&config.hostname).render())
            .await?;

        loop {
            line.clear();

            let n = tokio::select! {
                biased;
                _ = close.cancelled() => {
                    // Server-initiated close: best-effort goodbye, then drop the stream
                    let _ = writer
                        .write_all(&Reply::shutting_down(&config.hostname).render())
                        .await;
                    debug!(peer = %peer, "Connection closed by server");
                    return Ok(());
                }
                res = reader.read_line(&mut line) => res?,
            };

            if n == 0 {
                trace!(peer = %peer, "Connection closed by client");
                return Ok(());
            }

            if line.len() > config.max_line_length {
                writer.write_all(&Reply::line_too_long().render()).await?;
                continue;
            }

            if session.collecting_data {
                let body_line = line.trim_end_matches(['\r', '\n']);
                if body_line == "." {
                    info!(
                        peer = %peer,
                        client = session.client_name.as_deref().unwrap_or(""),
                        from = session.reverse_path.as_deref().unwrap_or(""),
                        recipients = session.forward_paths.len(),
                        bytes = data.len(),
                        "Message accepted"
                    );
                    data.clear();
                    session.reset_envelope();
                    writer.write_all(&Reply::ok("OK").render()).await?;
                } else {
                    // Dot-unstuffing: a leading dot escapes the terminator
                    let stored = body_line.strip_prefix('.').unwrap_or(body_line);
                    data.extend_from_slice(stored.as_bytes());
                    data.extend_from_slice(b"\r\n");
                }
                continue;
            }

            let reply = match CommandLine::parse(&line) {
                Some(cmd) => {
                    trace!(peer = %peer, verb = %cmd.verb, "Processing command");
                    match verbs.get(&cmd.verb) {
                        Some(verb) => verb.process(&mut session, &cmd.args),
                        // Unknown keyword is the engine's call, not the map's
                        None => Reply::unrecognized(),
                    }
                }
                None => Reply::unrecognized(),
            };

            writer.write_all(&reply.render()).await?;

            if session.quitting {
                debug!(peer = %peer, "Connection closed by QUIT");
                return Ok(());
            }
        }
    }
}
