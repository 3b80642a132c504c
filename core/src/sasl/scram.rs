/*
 * scram.rs
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

//! SCRAM-SHA-256 client (RFC 5802, RFC 7677). No channel binding ("n,,").

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{SaslClient, SaslError};

type HmacSha256 = Hmac<Sha256>;

enum Stage {
    Initial,
    FirstSent {
        client_nonce: String,
        client_first_bare: String,
    },
    FinalSent {
        server_signature: Vec<u8>,
    },
    Done,
}

pub struct ScramSha256 {
    authcid: String,
    password: String,
    stage: Stage,
}

impl ScramSha256 {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            password: password.into(),
            stage: Stage::Initial,
        }
    }
}

const GS2_HEADER: &str = "n,,";

impl SaslClient for ScramSha256 {
    fn mechanism(&self) -> &'static str {
        "SCRAM-SHA-256"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        let mut nonce_bytes = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let client_nonce = BASE64.encode(nonce_bytes);
        let client_first_bare = format!("n={},r={}", sasl_name(&self.authcid), client_nonce);
        let message = format!("{}{}", GS2_HEADER, client_first_bare);
        self.stage = Stage::FirstSent {
            client_nonce,
            client_first_bare,
        };
        Ok(Some(message.into_bytes()))
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::FirstSent {
                client_nonce,
                client_first_bare,
            } => {
                let server_first = String::from_utf8(challenge.to_vec())
                    .map_err(|_| SaslError::invalid("server-first not UTF-8"))?;
                let (nonce, salt_b64, iter_str) = parse_server_first(&server_first)?;
                if !nonce.starts_with(&client_nonce) {
                    return Err(SaslError::invalid("server nonce must extend client nonce"));
                }
                let salt = BASE64
                    .decode(salt_b64)
                    .map_err(|_| SaslError::invalid("invalid salt base64"))?;
                let iterations: u32 = iter_str
                    .parse()
                    .map_err(|_| SaslError::invalid("invalid iteration count"))?;

                let salted_password = hi(&self.password, &salt, iterations);
                let client_key = hmac(&salted_password, b"Client Key");
                let stored_key = Sha256::digest(&client_key);
                let server_key = hmac(&salted_password, b"Server Key");

                let client_final_no_proof =
                    format!("c={},r={}", BASE64.encode(GS2_HEADER.as_bytes()), nonce);
                let auth_message = format!(
                    "{},{},{}",
                    client_first_bare, server_first, client_final_no_proof
                );
                let client_signature = hmac(&stored_key, auth_message.as_bytes());
                let client_proof: Vec<u8> = client_key
                    .iter()
                    .zip(client_signature.iter())
                    .map(|(a, b)| a ^ b)
                    .collect();
                let server_signature = hmac(&server_key, auth_message.as_bytes());
                self.stage = Stage::FinalSent { server_signature };
                let message = format!(
                    "{},p={}",
                    client_final_no_proof,
                    BASE64.encode(&client_proof)
                );
                Ok(message.into_bytes())
            }
            Stage::FinalSent { server_signature } => {
                // server-final: v=<signature>. Verify the server knows the key.
                let text = String::from_utf8_lossy(challenge);
                let v = text
                    .split(',')
                    .find_map(|p| p.trim().strip_prefix("v="))
                    .ok_or_else(|| SaslError::invalid("missing v in server-final"))?;
                let sig = BASE64
                    .decode(v.trim())
                    .map_err(|_| SaslError::invalid("invalid server signature base64"))?;
                if sig != server_signature {
                    return Err(SaslError::invalid("server signature mismatch"));
                }
                self.stage = Stage::Done;
                Ok(Vec::new())
            }
            _ => Err(SaslError::invalid("SCRAM exchange out of order")),
        }
    }
}

fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

fn parse_server_first(input: &str) -> Result<(String, String, String), SaslError> {
    let mut r = None;
    let mut s = None;
    let mut i = None;
    for part in input.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("r=") {
            r = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("s=") {
            s = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("i=") {
            i = Some(v.to_string());
        }
    }
    let r = r.ok_or_else(|| SaslError::invalid("missing r in server-first"))?;
    let s = s.ok_or_else(|| SaslError::invalid("missing s in server-first"))?;
    let i = i.ok_or_else(|| SaslError::invalid("missing i in server-first"))?;
    Ok((r, s, i))
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
