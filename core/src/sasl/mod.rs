/*
 * mod.rs
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

//! SASL clients. Mechanisms implement [`SaslClient`]; the SMTP and IMAP state
//! machines base64-frame the exchange (AUTH 334 / AUTHENTICATE +) and feed
//! decoded challenges through `respond`.
//!
//! PLAIN, LOGIN, CRAM-MD5, SCRAM-SHA-256 and XOAUTH2 are provided.

mod mechanism;
mod plain;
mod scram;
mod xoauth2;

pub use mechanism::{client_for, SaslMechanism};
pub use plain::Plain;
pub use scram::ScramSha256;
pub use xoauth2::XOAuth2;

use hmac::Mac;

#[derive(Debug)]
pub struct SaslError {
    pub message: String,
}

impl SaslError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SaslError {}

/// One side of a SASL exchange. The protocol layer owns transport framing and
/// base64; challenges and responses here are raw bytes.
pub trait SaslClient: Send {
    /// Mechanism name as advertised by servers (e.g. "SCRAM-SHA-256").
    fn mechanism(&self) -> &'static str;

    /// Initial response for client-first mechanisms, None for server-first.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(None)
    }

    /// Respond to a decoded server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError>;
}

/// LOGIN: obsolete two-step exchange, username then password prompts.
pub struct Login {
    authcid: String,
    password: String,
}

impl Login {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl SaslClient for Login {
    fn mechanism(&self) -> &'static str {
        "LOGIN"
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let prompt = String::from_utf8_lossy(challenge).to_lowercase();
        if prompt.contains("username") {
            Ok(self.authcid.clone().into_bytes())
        } else if prompt.contains("password") {
            Ok(self.password.clone().into_bytes())
        } else {
            Err(SaslError::invalid("unexpected LOGIN challenge"))
        }
    }
}

type HmacMd5 = hmac::Hmac<md5::Md5>;

/// CRAM-MD5 (RFC 2195): HMAC-MD5 over the server timestamp challenge.
pub struct CramMd5 {
    authcid: String,
    password: String,
}

impl CramMd5 {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl SaslClient for CramMd5 {
    fn mechanism(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let mut mac = HmacMd5::new_from_slice(self.password.as_bytes())
            .map_err(|_| SaslError::invalid("bad CRAM-MD5 key"))?;
        mac.update(challenge);
        let digest = mac.finalize().into_bytes();
        let mut response = String::with_capacity(self.authcid.len() + 1 + digest.len() * 2);
        response.push_str(&self.authcid);
        response.push(' ');
        for b in digest {
            response.push_str(&format!("{:02x}", b));
        }
        Ok(response.into_bytes())
    }
}
