/*
 * dkim.rs
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

//! DKIM verification (RFC 6376). For each DKIM-Signature header: check the
//! body hash (`bh=`, honoring `l=`), fetch the public key from
//! `selector._domainkey.domain`, and verify the RSA signature over the
//! canonicalized header set plus the signature header itself with `b=`
//! cleared.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::dns::Resolver;

use super::canonical::{canonicalize_body, canonicalize_header, split_message, Canon, RawHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimResult {
    Pass,
    Fail,
    TempError,
    PermError,
    None,
}

/// Outcome for one signature.
#[derive(Debug, Clone)]
pub struct DkimVerification {
    pub result: DkimResult,
    pub domain: String,
    pub selector: String,
    pub reason: Option<String>,
}

impl DkimVerification {
    fn new(result: DkimResult, domain: &str, selector: &str, reason: Option<&str>) -> Self {
        Self {
            result,
            domain: domain.to_string(),
            selector: selector.to_string(),
            reason: reason.map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlg {
    Sha256,
    Sha1,
}

/// Verify every DKIM-Signature header in the message, in order of
/// appearance. A message without signatures yields a single `None` entry.
pub async fn verify_message(resolver: &dyn Resolver, message: &[u8]) -> Vec<DkimVerification> {
    let (headers, body) = split_message(message);
    let mut results = Vec::new();
    for (index, header) in headers.iter().enumerate() {
        if header.name.eq_ignore_ascii_case("DKIM-Signature") {
            results.push(verify_one(resolver, &headers, index, body).await);
        }
    }
    if results.is_empty() {
        results.push(DkimVerification::new(DkimResult::None, "", "", None));
    }
    results
}

async fn verify_one(
    resolver: &dyn Resolver,
    headers: &[RawHeader],
    signature_index: usize,
    body: &[u8],
) -> DkimVerification {
    let signature = &headers[signature_index];
    let value = String::from_utf8_lossy(signature.value()).into_owned();
    let tags = parse_tag_list(&value);
    let tag = |name: &str| tags.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    let domain = tag("d").unwrap_or("").to_string();
    let selector = tag("s").unwrap_or("").to_string();
    let fail = |result: DkimResult, reason: &str| {
        DkimVerification::new(result, &domain, &selector, Some(reason))
    };

    if tag("v") != Some("1") {
        return fail(DkimResult::PermError, "unsupported version");
    }
    let (Some(b), Some(bh), Some(h)) = (tag("b"), tag("bh"), tag("h")) else {
        return fail(DkimResult::PermError, "missing required tag");
    };
    if domain.is_empty() || selector.is_empty() {
        return fail(DkimResult::PermError, "missing domain or selector");
    }
    let algorithm = match tag("a") {
        Some("rsa-sha256") => HashAlg::Sha256,
        Some("rsa-sha1") => HashAlg::Sha1,
        _ => return fail(DkimResult::PermError, "unsupported algorithm"),
    };
    let (header_canon, body_canon) = match parse_canon(tag("c")) {
        Some(pair) => pair,
        None => return fail(DkimResult::PermError, "unsupported canonicalization"),
    };

    // Expiration is checked before any expensive work.
    if let Some(expiry) = tag("x").and_then(|x| x.parse::<i64>().ok()) {
        if chrono::Utc::now().timestamp() > expiry {
            return fail(DkimResult::Fail, "signature expired");
        }
    }

    // Body hash.
    let mut canonical_body = canonicalize_body(body, body_canon);
    if let Some(limit) = tag("l").and_then(|l| l.parse::<usize>().ok()) {
        if limit < canonical_body.len() {
            canonical_body.truncate(limit);
        }
    }
    let computed_bh = hash_bytes(&canonical_body, algorithm);
    let declared_bh = match BASE64.decode(strip_ws(bh)) {
        Ok(v) => v,
        Err(_) => return fail(DkimResult::PermError, "undecodable bh tag"),
    };
    if computed_bh != declared_bh {
        return fail(DkimResult::Fail, "body hash mismatch");
    }

    // Public key.
    let key_name = format!("{}._domainkey.{}", selector, domain);
    let response = match resolver.query_txt(&key_name).await {
        Ok(r) => r,
        Err(_) => return fail(DkimResult::TempError, "key lookup failed"),
    };
    if response.is_void() {
        return fail(DkimResult::PermError, "no key record");
    }
    let Some(key) = parse_key_record(&response.txt_strings().collect::<Vec<_>>()) else {
        return fail(DkimResult::PermError, "unusable key record");
    };

    // Header hash input: signed headers bottom-up, then the signature header
    // itself with b= cleared, without its trailing CRLF.
    let mut data = Vec::new();
    let mut used = vec![false; headers.len()];
    used[signature_index] = true;
    for name in h.split(':').map(|n| n.trim()) {
        if name.is_empty() {
            continue;
        }
        let found = headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, hdr)| !used[*i] && hdr.name.eq_ignore_ascii_case(name));
        if let Some((i, hdr)) = found {
            used[i] = true;
            data.extend_from_slice(&canonicalize_header(&hdr.raw, header_canon));
        }
    }
    let stripped = strip_b_value(&signature.raw);
    let mut canonical_sig = canonicalize_header(&stripped, header_canon);
    if canonical_sig.ends_with(b"\r\n") {
        canonical_sig.truncate(canonical_sig.len() - 2);
    }
    data.extend_from_slice(&canonical_sig);

    let signature_bytes = match BASE64.decode(strip_ws(b)) {
        Ok(v) => v,
        Err(_) => return fail(DkimResult::PermError, "undecodable b tag"),
    };
    let hashed = hash_bytes(&data, algorithm);
    let verified = match algorithm {
        HashAlg::Sha256 => key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature_bytes)
            .is_ok(),
        HashAlg::Sha1 => key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, &signature_bytes)
            .is_ok(),
    };
    if verified {
        DkimVerification::new(DkimResult::Pass, &domain, &selector, None)
    } else {
        fail(DkimResult::Fail, "signature verification failed")
    }
}

fn hash_bytes(data: &[u8], algorithm: HashAlg) -> Vec<u8> {
    match algorithm {
        HashAlg::Sha256 => Sha256::digest(data).to_vec(),
        HashAlg::Sha1 => Sha1::digest(data).to_vec(),
    }
}

fn parse_canon(tag: Option<&str>) -> Option<(Canon, Canon)> {
    let Some(value) = tag else {
        return Some((Canon::Simple, Canon::Simple));
    };
    match value.split_once('/') {
        Some((h, b)) => Some((Canon::parse(h)?, Canon::parse(b)?)),
        None => Some((Canon::parse(value)?, Canon::Simple)),
    }
}

/// Parse `k=`/`p=` out of the key TXT record(s); `p=` is a base64 SPKI (or
/// bare PKCS#1) RSA public key. An empty `p=` means the key was revoked.
fn parse_key_record(txts: &[&str]) -> Option<RsaPublicKey> {
    for txt in txts {
        let tags = parse_tag_list(txt);
        let get = |name: &str| tags.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let Some(p) = get("p") else { continue };
        if let Some(k) = get("k") {
            if !k.eq_ignore_ascii_case("rsa") {
                continue;
            }
        }
        let der = BASE64.decode(strip_ws(p)).ok()?;
        if der.is_empty() {
            return None;
        }
        if let Ok(key) = RsaPublicKey::from_public_key_der(&der) {
            return Some(key);
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_der(&der) {
            return Some(key);
        }
    }
    None
}

/// Parse a `tag=value; tag=value` list. Folding whitespace inside values is
/// preserved except around the separators; `b=`/`bh=` consumers strip it.
pub(crate) fn parse_tag_list(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for part in value.split(';') {
        let Some((name, val)) = part.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        out.push((
            name.to_string(),
            val.trim().trim_matches(|c| c == '\r' || c == '\n').to_string(),
        ));
    }
    out
}

fn strip_ws(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Remove the value of the `b=` tag from a raw DKIM-Signature field, keeping
/// everything else byte-identical (RFC 6376 §3.7).
pub(crate) fn strip_b_value(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let colon = match raw.iter().position(|&b| b == b':') {
        Some(i) => i,
        None => return raw.to_vec(),
    };
    out.extend_from_slice(&raw[..colon + 1]);
    let mut i = colon + 1;
    loop {
        // Copy whitespace preceding a tag name.
        while i < raw.len() && (raw[i].is_ascii_whitespace()) {
            out.push(raw[i]);
            i += 1;
        }
        if i >= raw.len() {
            break;
        }
        // Read the tag name.
        let name_start = i;
        while i < raw.len() && raw[i] != b'=' && raw[i] != b';' {
            i += 1;
        }
        let name: Vec<u8> = raw[name_start..i]
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        out.extend_from_slice(&raw[name_start..i]);
        if i >= raw.len() {
            break;
        }
        if raw[i] == b';' {
            out.push(b';');
            i += 1;
            continue;
        }
        // At '='.
        out.push(b'=');
        i += 1;
        let value_start = i;
        while i < raw.len() && raw[i] != b';' {
            i += 1;
        }
        if name != b"b" {
            out.extend_from_slice(&raw[value_start..i]);
        }
        if i < raw.len() {
            out.push(b';');
            i += 1;
        }
    }
    out
}
