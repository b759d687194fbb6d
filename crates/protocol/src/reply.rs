//! Host-side parsing of device responses.

use std::fmt;

use crate::{parse_adc, parse_position, Position};

/// One complete response, as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok {
        /// Whatever followed `OK` on the terminating line.
        payload: String,
        /// Lines that came before the terminating `OK` (e.g. the body of a
        /// `STATUS` response).
        info: Vec<String>,
    },
    /// The device's message, without the `ERROR:` prefix.
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyError {
    pub reply: String,
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed reply: {:?}", self.reply)
    }
}

impl std::error::Error for ReplyError {}

impl Reply {
    pub fn payload(&self) -> Option<&str> {
        match self {
            Reply::Ok { payload, .. } => Some(payload),
            Reply::Error(_) => None,
        }
    }

    pub fn position(&self) -> Result<Position, ReplyError> {
        self.payload()
            .and_then(parse_position)
            .ok_or_else(|| self.malformed())
    }

    pub fn adc(&self) -> Result<[u16; 4], ReplyError> {
        self.payload()
            .and_then(parse_adc)
            .ok_or_else(|| self.malformed())
    }

    fn malformed(&self) -> ReplyError {
        ReplyError {
            reply: match self {
                Reply::Ok { payload, .. } => format!("OK {payload}"),
                Reply::Error(msg) => format!("ERROR: {msg}"),
            },
        }
    }
}

/// Accumulates response lines until a complete reply has arrived.
#[derive(Default, Debug)]
pub struct ReplyReader {
    info: Vec<String>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (with or without its terminator). Returns the reply
    /// once the terminating `OK` or `ERROR` line has been seen.
    pub fn push_line(&mut self, line: &str) -> Option<Reply> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("ERROR") {
            self.info.clear();
            let msg = rest.trim_start_matches(':').trim();
            return Some(Reply::Error(msg.to_owned()));
        }

        if let Some(rest) = line.strip_prefix("OK") {
            // Guard against informational lines that happen to start with
            // the letters "OK".
            if rest.is_empty() || rest.starts_with(' ') {
                return Some(Reply::Ok {
                    payload: rest.trim().to_owned(),
                    info: std::mem::take(&mut self.info),
                });
            }
        }

        self.info.push(line.to_owned());
        None
    }
}
