/*
 * mechanism.rs
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

//! Mechanism metadata and selection.

use super::{CramMd5, Login, Plain, SaslClient, ScramSha256, XOAuth2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    Login,
    CramMd5,
    ScramSha256,
    XOAuth2,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Login => "LOGIN",
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::XOAuth2 => "XOAUTH2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            "LOGIN" => Some(SaslMechanism::Login),
            "CRAM-MD5" => Some(SaslMechanism::CramMd5),
            "SCRAM-SHA-256" => Some(SaslMechanism::ScramSha256),
            "XOAUTH2" => Some(SaslMechanism::XOAuth2),
            _ => None,
        }
    }

    /// Whether the server sends challenges after the initial command.
    pub fn is_challenge_response(&self) -> bool {
        matches!(
            self,
            SaslMechanism::Login | SaslMechanism::CramMd5 | SaslMechanism::ScramSha256
        )
    }

    /// Mechanisms that transmit the secret (or a bearer token) and must only
    /// run over an encrypted channel.
    pub fn requires_tls(&self) -> bool {
        matches!(
            self,
            SaslMechanism::Plain | SaslMechanism::Login | SaslMechanism::XOAuth2
        )
    }
}

/// Construct a client for the given mechanism. For XOAUTH2 the secret is the
/// OAuth2 access token; elsewhere it is the password.
pub fn client_for(
    mechanism: SaslMechanism,
    authcid: &str,
    secret: &str,
) -> Box<dyn SaslClient> {
    match mechanism {
        SaslMechanism::Plain => Box::new(Plain::new("", authcid, secret)),
        SaslMechanism::Login => Box::new(Login::new(authcid, secret)),
        SaslMechanism::CramMd5 => Box::new(CramMd5::new(authcid, secret)),
        SaslMechanism::ScramSha256 => Box::new(ScramSha256::new(authcid, secret)),
        SaslMechanism::XOAuth2 => Box::new(XOAuth2::new(authcid, secret)),
    }
}
