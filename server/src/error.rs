// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the whole service.
///
/// Pollers absorb `Transport` locally and keep running; the HTTP edge maps
/// every variant onto a status code via [`Error::http_status`]. Only startup
/// resource acquisition treats errors as fatal.
#[derive(Debug)]
pub enum Error {
    /// Upstream HTTP/TCP/WS failure, with target context.
    Transport(String),
    /// Bad input from a browser client.
    InvalidInput(String),
    /// Unknown server id, object or sensor.
    NotFound(String),
    /// Feature disabled by configuration.
    Unavailable(String),
    /// Control token denied.
    Conflict(String),
    /// Bad magic or short buffer on a binary stream.
    Framing(String),
    /// Store corruption or other unexpected failure.
    Internal(String),
    Io(std::io::Error),
}

impl Error {
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Transport(_) => 502,
            Error::InvalidInput(_) => 400,
            Error::NotFound(_) => 404,
            Error::Unavailable(_) => 503,
            Error::Conflict(_) => 409,
            Error::Framing(_) => 502,
            Error::Internal(_) => 500,
            Error::Io(_) => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "transport: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Error::Conflict(msg) => write!(f, "{msg}"),
            Error::Framing(msg) => write!(f, "framing: {msg}"),
            Error::Internal(msg) => write!(f, "internal: {msg}"),
            Error::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::Transport("x".into()).http_status(), 502);
        assert_eq!(Error::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::Unavailable("x".into()).http_status(), 503);
        assert_eq!(Error::Conflict("x".into()).http_status(), 409);
        assert_eq!(Error::Framing("x".into()).http_status(), 502);
    }
}
