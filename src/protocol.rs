//! Protocol boundary: logical addresses, typed argument reading, and
//! reply construction.
//!
//! The wire format is OSC 1.0; encoding and decoding are delegated to the
//! `rosc` crate. This module keeps the rest of the crate working with
//! categorized errors instead of raw codec types: every accessor fails
//! with `AppError::MalformedRequest` naming the offending field.

use rosc::{OscMessage, OscType};

use crate::{AppError, Result};

/// Address for spawning a new client in the current session.
pub const ADDR_SERVER_ADD: &str = "/stagehand/server/add";
/// Address on which spawned clients identify themselves.
pub const ADDR_SERVER_ANNOUNCE: &str = "/stagehand/server/announce";
/// Address for creating a new session.
pub const ADDR_SERVER_NEW: &str = "/stagehand/server/new";
/// Address for removing a session.
pub const ADDR_SERVER_REMOVE: &str = "/stagehand/server/remove";
/// Address for listing the current session's announced clients.
pub const ADDR_SERVER_CLIENTS: &str = "/stagehand/server/clients";
/// Address for listing all sessions.
pub const ADDR_SERVER_SESSIONS: &str = "/stagehand/server/sessions";
/// Address for fetching a client's captured output.
pub const ADDR_SERVER_LOGS: &str = "/stagehand/server/logs";
/// Liveness probe address.
pub const ADDR_PING: &str = "/ping";
/// Liveness probe response address.
pub const ADDR_PONG: &str = "/pong";
/// Success reply address; the first argument names the originating address.
pub const ADDR_REPLY: &str = "/reply";
/// Error reply address carrying (originating address, code, message).
pub const ADDR_ERROR: &str = "/error";

/// Stream selector for a client's captured stdout.
pub const STDOUT_SELECTOR: i32 = 1;
/// Stream selector for a client's captured stderr.
pub const STDERR_SELECTOR: i32 = 2;

/// Typed view over a decoded message's ordered argument list.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    args: &'a [OscType],
}

impl<'a> Args<'a> {
    /// Wrap a decoded argument slice.
    #[must_use]
    pub fn new(args: &'a [OscType]) -> Self {
        Self { args }
    }

    /// Number of arguments present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the message carried no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Require an exact argument count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedRequest` if the count differs.
    pub fn expect_len(&self, expected: usize, operation: &str) -> Result<()> {
        if self.args.len() == expected {
            Ok(())
        } else {
            Err(AppError::MalformedRequest(format!(
                "{operation} expects {expected} arguments, got {}",
                self.args.len()
            )))
        }
    }

    /// Read a string argument at `index`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedRequest` if the argument is absent or
    /// not a string.
    pub fn string(&self, index: usize, field: &str) -> Result<&'a str> {
        match self.args.get(index) {
            Some(OscType::String(value)) => Ok(value),
            Some(other) => Err(AppError::MalformedRequest(format!(
                "{field} must be a string, got {other:?}"
            ))),
            None => Err(AppError::MalformedRequest(format!("{field} is missing"))),
        }
    }

    /// Read an int32 argument at `index`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedRequest` if the argument is absent or
    /// not an int32.
    pub fn int(&self, index: usize, field: &str) -> Result<i32> {
        match self.args.get(index) {
            Some(OscType::Int(value)) => Ok(*value),
            Some(other) => Err(AppError::MalformedRequest(format!(
                "{field} must be an int32, got {other:?}"
            ))),
            None => Err(AppError::MalformedRequest(format!("{field} is missing"))),
        }
    }
}

/// Build a success reply for `address` with the given payload appended
/// after the originating address.
#[must_use]
pub fn reply(address: &str, payload: Vec<OscType>) -> OscMessage {
    let mut args = Vec::with_capacity(payload.len() + 1);
    args.push(OscType::String(address.to_owned()));
    args.extend(payload);
    OscMessage {
        addr: ADDR_REPLY.to_owned(),
        args,
    }
}

/// Build an error reply for `address` from a categorized failure.
#[must_use]
pub fn error_reply(address: &str, err: &AppError) -> OscMessage {
    OscMessage {
        addr: ADDR_ERROR.to_owned(),
        args: vec![
            OscType::String(address.to_owned()),
            OscType::Int(err.code()),
            OscType::String(err.to_string()),
        ],
    }
}

/// Parse a colon-separated capability string into its tokens.
#[must_use]
pub fn parse_capabilities(raw: &str) -> Vec<String> {
    raw.split(':')
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Format capability tokens as a colon-separated string, colon-delimited
/// on both ends when non-empty.
#[must_use]
pub fn format_capabilities(tokens: &[&str]) -> String {
    if tokens.is_empty() {
        String::new()
    } else {
        format!(":{}:", tokens.join(":"))
    }
}
