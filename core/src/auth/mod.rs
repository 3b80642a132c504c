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

//! Email authentication pipeline: SPF, DKIM and DMARC over an injected
//! resolver. The pipeline runs during SMTP reception without blocking the
//! connection: every DNS wait is an await point, and per-check state lives
//! in the context structs, so no locking is involved when the calls run on
//! the connection's selector loop.

pub mod canonical;
pub mod dkim;
pub mod dmarc;
pub mod spf;

use std::net::IpAddr;
use std::sync::Arc;

use mailparse::MailHeaderMap;

use crate::dns::Resolver;

pub use dkim::{DkimResult, DkimVerification};
pub use dmarc::{Disposition, DmarcOutcome, DmarcResult};
pub use spf::{SpfOutcome, SpfResult};

/// Final disposition for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Accept,
    Quarantine,
    Reject,
}

/// Inputs for one inbound message.
pub struct AuthRequest<'a> {
    pub client_ip: IpAddr,
    pub helo: &'a str,
    /// Envelope sender (MAIL FROM); empty for bounces.
    pub mail_from: &'a str,
    /// Raw message bytes: headers and body as received.
    pub message: &'a [u8],
}

/// Combined result of all three checks.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub spf: SpfOutcome,
    pub dkim: Vec<DkimVerification>,
    pub dmarc: DmarcOutcome,
    pub verdict: AuthVerdict,
}

/// Coordinates SPF, DKIM and DMARC for inbound messages.
pub struct EmailAuthPipeline {
    resolver: Arc<dyn Resolver>,
}

impl EmailAuthPipeline {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// Run every check and derive the verdict from the DMARC disposition.
    pub async fn authenticate(&self, request: &AuthRequest<'_>) -> AuthOutcome {
        let resolver = self.resolver.as_ref();
        let spf = spf::check_host(
            resolver,
            request.client_ip,
            request.mail_from,
            request.helo,
        )
        .await;
        let dkim = dkim::verify_message(resolver, request.message).await;

        let spf_domain = envelope_domain(request.mail_from)
            .unwrap_or_else(|| request.helo.to_string());
        let dmarc = match from_domain(request.message) {
            Some(from) => {
                dmarc::evaluate(resolver, &from, &spf, &spf_domain, &dkim).await
            }
            None => DmarcOutcome {
                result: DmarcResult::None,
                disposition: Disposition::None,
                record: None,
            },
        };

        let verdict = match (dmarc.result, dmarc.disposition) {
            (DmarcResult::Fail, Disposition::Reject) => AuthVerdict::Reject,
            (DmarcResult::Fail, Disposition::Quarantine) => AuthVerdict::Quarantine,
            _ => AuthVerdict::Accept,
        };

        AuthOutcome {
            spf,
            dkim,
            dmarc,
            verdict,
        }
    }
}

fn envelope_domain(mail_from: &str) -> Option<String> {
    let addr = mail_from.trim().trim_matches(|c| c == '<' || c == '>');
    addr.rsplit_once('@').map(|(_, d)| d.to_lowercase())
}

/// RFC 5322 From domain, via the black-box header parser.
fn from_domain(message: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(message).ok()?;
    let from = headers.get_first_value("From")?;
    let parsed = mailparse::addrparse(&from).ok()?;
    for addr in parsed.iter() {
        if let mailparse::MailAddr::Single(info) = addr {
            if let Some((_, domain)) = info.addr.rsplit_once('@') {
                return Some(domain.to_lowercase());
            }
        }
    }
    None
}
