/*
 * plain.rs
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

//! PLAIN (RFC 4616): authzid NUL authcid NUL passwd, in one client-first blob.

use super::{SaslClient, SaslError};

pub struct Plain {
    authzid: String,
    authcid: String,
    password: String,
}

impl Plain {
    pub fn new(
        authzid: impl Into<String>,
        authcid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            authzid: authzid.into(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl SaslClient for Plain {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        if self.authcid.contains('\0') || self.password.contains('\0') {
            return Err(SaslError::invalid("NUL in PLAIN credentials"));
        }
        let mut out =
            Vec::with_capacity(self.authzid.len() + self.authcid.len() + self.password.len() + 2);
        out.extend_from_slice(self.authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.authcid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Ok(Some(out))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        Err(SaslError::invalid("PLAIN expects no server challenge"))
    }
}
