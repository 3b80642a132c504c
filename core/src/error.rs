/*
 * error.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, a non-blocking network protocol framework.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Error taxonomy shared by the transport and the protocol clients.

use std::fmt;
use std::io;

/// Broad classification of a failure, used by callers to decide retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP or TLS failure, peer reset. The connection is closed.
    Transport,
    /// Unparseable input, tag mismatch, or an operation issued in an
    /// impossible state. The connection is closed (or the call rejected).
    Protocol,
    /// Transient server condition; the caller may retry later.
    Temporary,
    /// Definitive server rejection, handled per request.
    Permanent,
    /// SASL exchange failed (bad credentials); re-authentication may succeed.
    AuthChallengeFail,
    /// Resolver SERVFAIL or timeout.
    DnsTempFail,
    /// Resolver NXDOMAIN or permanently unusable answer.
    DnsPermFail,
}

/// Error value carrying a kind and a human-readable message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Temporary, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn dns_temp(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DnsTempFail, message)
    }

    pub fn dns_perm(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DnsPermFail, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for kinds a caller may usefully retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Temporary | ErrorKind::AuthChallengeFail | ErrorKind::DnsTempFail
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::transport(e.to_string())
    }
}
