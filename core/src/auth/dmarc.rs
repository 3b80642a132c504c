/*
 * dmarc.rs
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

//! DMARC evaluation (RFC 7489). The result is PASS iff SPF or DKIM passed
//! *and* the passing identifier aligns with the RFC 5322 From domain under
//! the record's alignment mode; on failure the disposition derives from the
//! published policy, subject to `pct` sampling.

use rand::Rng;

use crate::dns::Resolver;

use super::dkim::{DkimResult, DkimVerification};
use super::spf::{SpfOutcome, SpfResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    TempError,
    PermError,
}

/// What the receiver should do with a failing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    Relaxed,
    Strict,
}

/// Parsed `_dmarc` policy record.
#[derive(Debug, Clone)]
pub struct DmarcRecord {
    pub policy: Disposition,
    pub subdomain_policy: Option<Disposition>,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    pub pct: u8,
}

#[derive(Debug, Clone)]
pub struct DmarcOutcome {
    pub result: DmarcResult,
    pub disposition: Disposition,
    pub record: Option<DmarcRecord>,
}

impl DmarcOutcome {
    fn bare(result: DmarcResult) -> Self {
        Self {
            result,
            disposition: Disposition::None,
            record: None,
        }
    }
}

/// Organizational domain via the public suffix list; falls back to the input
/// when the name is not registrable (e.g. a bare TLD).
pub fn organizational_domain(domain: &str) -> String {
    psl::domain(domain.as_bytes())
        .map(|d| String::from_utf8_lossy(d.as_bytes()).to_lowercase())
        .unwrap_or_else(|| domain.to_lowercase())
}

/// Identifier alignment: relaxed compares organizational domains, strict
/// requires an exact match.
pub fn aligned(authenticated: &str, from_domain: &str, mode: AlignmentMode) -> bool {
    if authenticated.is_empty() || from_domain.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => authenticated.eq_ignore_ascii_case(from_domain),
        AlignmentMode::Relaxed => {
            organizational_domain(authenticated) == organizational_domain(from_domain)
        }
    }
}

/// Evaluate DMARC for a message whose From domain, SPF outcome and DKIM
/// outcomes are known. `spf_domain` is the domain SPF authenticated (MAIL
/// FROM, or HELO for empty envelopes).
pub async fn evaluate(
    resolver: &dyn Resolver,
    from_domain: &str,
    spf: &SpfOutcome,
    spf_domain: &str,
    dkim: &[DkimVerification],
) -> DmarcOutcome {
    let record = match fetch_record(resolver, from_domain).await {
        Ok(Some(record)) => record,
        Ok(None) => return DmarcOutcome::bare(DmarcResult::None),
        Err(result) => return DmarcOutcome::bare(result),
    };

    let spf_aligned =
        spf.result == SpfResult::Pass && aligned(spf_domain, from_domain, record.aspf);
    let dkim_aligned = dkim.iter().any(|v| {
        v.result == DkimResult::Pass && aligned(&v.domain, from_domain, record.adkim)
    });

    if spf_aligned || dkim_aligned {
        return DmarcOutcome {
            result: DmarcResult::Pass,
            disposition: Disposition::None,
            record: Some(record),
        };
    }

    let is_subdomain =
        !from_domain.eq_ignore_ascii_case(&organizational_domain(from_domain));
    let mut disposition = match (is_subdomain, record.subdomain_policy) {
        (true, Some(sp)) => sp,
        _ => record.policy,
    };
    if record.pct < 100 && rand::thread_rng().gen_range(0..100) >= record.pct {
        // Sampled out: apply the next-weaker disposition.
        disposition = match disposition {
            Disposition::Reject => Disposition::Quarantine,
            _ => Disposition::None,
        };
    }
    DmarcOutcome {
        result: DmarcResult::Fail,
        disposition,
        record: Some(record),
    }
}

/// Fetch `_dmarc.<from>`; when absent, fall back to the organizational
/// domain's record (RFC 7489 §6.6.3).
async fn fetch_record(
    resolver: &dyn Resolver,
    from_domain: &str,
) -> Result<Option<DmarcRecord>, DmarcResult> {
    match lookup(resolver, from_domain).await? {
        Some(record) => Ok(Some(record)),
        None => {
            let org = organizational_domain(from_domain);
            if org.eq_ignore_ascii_case(from_domain) {
                Ok(None)
            } else {
                lookup(resolver, &org).await
            }
        }
    }
}

async fn lookup(
    resolver: &dyn Resolver,
    domain: &str,
) -> Result<Option<DmarcRecord>, DmarcResult> {
    let name = format!("_dmarc.{}", domain);
    let response = resolver
        .query_txt(&name)
        .await
        .map_err(|_| DmarcResult::TempError)?;
    for txt in response.txt_strings() {
        if let Some(record) = parse_record(txt) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn parse_record(txt: &str) -> Option<DmarcRecord> {
    let tags = super::dkim::parse_tag_list(txt);
    let get = |name: &str| {
        tags.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };
    if !get("v")?.eq_ignore_ascii_case("DMARC1") {
        return None;
    }
    let policy = parse_disposition(get("p")?)?;
    let subdomain_policy = get("sp").and_then(parse_disposition);
    let adkim = parse_alignment(get("adkim")).unwrap_or(AlignmentMode::Relaxed);
    let aspf = parse_alignment(get("aspf")).unwrap_or(AlignmentMode::Relaxed);
    let pct = get("pct")
        .and_then(|v| v.parse().ok())
        .map(|p: u8| p.min(100))
        .unwrap_or(100);
    Some(DmarcRecord {
        policy,
        subdomain_policy,
        adkim,
        aspf,
        pct,
    })
}

fn parse_disposition(value: &str) -> Option<Disposition> {
    match value.to_lowercase().as_str() {
        "none" => Some(Disposition::None),
        "quarantine" => Some(Disposition::Quarantine),
        "reject" => Some(Disposition::Reject),
        _ => None,
    }
}

fn parse_alignment(value: Option<&str>) -> Option<AlignmentMode> {
    match value? {
        "r" | "R" => Some(AlignmentMode::Relaxed),
        "s" | "S" => Some(AlignmentMode::Strict),
        _ => None,
    }
}
