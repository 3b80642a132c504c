/*
 * spf.rs
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

//! SPF evaluation (RFC 7208). Mechanisms evaluate in record order; the first
//! match decides the result through its qualifier. `include` recurses with
//! the same budget: at most 10 DNS-consuming terms (a, mx, ptr, include,
//! exists, redirect) and at most 2 void lookups per check. The budget is
//! enforced before a lookup is issued, so an over-limit record fails fast
//! with PERMERROR.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;

use crate::dns::{DnsResponse, Resolver};

/// DNS-consuming terms allowed per check.
pub const MAX_DNS_LOOKUPS: u32 = 10;
/// Void (NXDOMAIN or empty) answers allowed per check.
pub const MAX_VOID_LOOKUPS: u32 = 2;
/// MX exchanges / PTR names considered per mechanism.
const MAX_NAMES_PER_MECHANISM: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

/// Outcome of one check: result, the mechanism that matched (when any), and
/// the number of DNS-consuming terms evaluated.
#[derive(Debug, Clone)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub matched: Option<String>,
    pub lookups: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone)]
enum Term {
    All(Qualifier),
    Ip4(Qualifier, Ipv4Addr, u8),
    Ip6(Qualifier, Ipv6Addr, u8),
    A {
        qualifier: Qualifier,
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Mx {
        qualifier: Qualifier,
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Include(Qualifier, String),
    Exists(Qualifier, String),
    Ptr(Qualifier, Option<String>),
    Redirect(String),
    Exp(String),
    UnknownModifier,
}

enum CheckError {
    Temp,
    Perm,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Evaluate SPF for a received message.
///
/// `sender` is the envelope MAIL FROM address; when empty (bounces), the
/// check runs against `postmaster@helo` per RFC 7208 §2.4.
pub async fn check_host(
    resolver: &dyn Resolver,
    client_ip: IpAddr,
    sender: &str,
    helo: &str,
) -> SpfOutcome {
    let sender = if sender.is_empty() {
        format!("postmaster@{}", helo)
    } else if sender.contains('@') {
        sender.to_string()
    } else {
        format!("postmaster@{}", sender)
    };
    let (local, domain) = match sender.rsplit_once('@') {
        Some((l, d)) => (l.to_string(), d.to_string()),
        None => ("postmaster".to_string(), sender.clone()),
    };
    let mut session = Session {
        resolver,
        client_ip,
        sender,
        local,
        sender_domain: domain.clone(),
        helo: helo.to_string(),
        lookups: 0,
        voids: 0,
        matched: None,
    };
    let result = match session.evaluate(domain).await {
        Ok(r) => r,
        Err(CheckError::Temp) => SpfResult::TempError,
        Err(CheckError::Perm) => SpfResult::PermError,
    };
    SpfOutcome {
        result,
        matched: session.matched,
        lookups: session.lookups,
    }
}

struct Session<'a> {
    resolver: &'a dyn Resolver,
    client_ip: IpAddr,
    sender: String,
    local: String,
    sender_domain: String,
    helo: String,
    lookups: u32,
    voids: u32,
    matched: Option<String>,
}

impl Session<'_> {
    /// Charge one DNS-consuming term against the budget, before the lookup.
    fn budget(&mut self) -> Result<(), CheckError> {
        if self.lookups >= MAX_DNS_LOOKUPS {
            tracing::debug!("SPF lookup budget exhausted");
            return Err(CheckError::Perm);
        }
        self.lookups += 1;
        Ok(())
    }

    fn count_void(&mut self, response: &DnsResponse) -> Result<(), CheckError> {
        if response.is_void() {
            self.voids += 1;
            if self.voids > MAX_VOID_LOOKUPS {
                tracing::debug!("SPF void lookup budget exhausted");
                return Err(CheckError::Perm);
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, domain: String) -> BoxFuture<'_, Result<SpfResult, CheckError>> {
        Box::pin(async move {
            let Some(record) = self.fetch_record(&domain).await? else {
                return Ok(SpfResult::None);
            };
            let terms = parse_record(&record).ok_or(CheckError::Perm)?;
            let mut redirect = None;
            for term in &terms {
                match term {
                    Term::Redirect(spec) => redirect = Some(spec.clone()),
                    Term::Exp(_) | Term::UnknownModifier => {}
                    mechanism => {
                        if self.matches(mechanism, &domain).await? {
                            self.matched = Some(format!("{:?}", mechanism));
                            return Ok(qualifier_of(mechanism).result());
                        }
                    }
                }
            }
            if let Some(spec) = redirect {
                self.budget()?;
                let target = self
                    .expand(&spec, &domain, false)
                    .map_err(|_| CheckError::Perm)?;
                let result = self.evaluate(target).await?;
                // A redirect target without a record is a permanent error.
                if result == SpfResult::None {
                    return Err(CheckError::Perm);
                }
                return Ok(result);
            }
            Ok(SpfResult::Neutral)
        })
    }

    /// Fetch the SPF record: exactly one TXT record starting `v=spf1`. The
    /// record fetch itself is not charged against the term budget.
    async fn fetch_record(&mut self, domain: &str) -> Result<Option<String>, CheckError> {
        let response = self
            .resolver
            .query_txt(domain)
            .await
            .map_err(|_| CheckError::Temp)?;
        let mut records = response.txt_strings().filter(|s| {
            let lower = s.trim_start().to_lowercase();
            lower == "v=spf1" || lower.starts_with("v=spf1 ")
        });
        let first = records.next().map(|s| s.to_string());
        if records.next().is_some() {
            // Multiple SPF records are a permanent error (RFC 7208 §4.5).
            return Err(CheckError::Perm);
        }
        Ok(first)
    }

    async fn matches(&mut self, term: &Term, domain: &str) -> Result<bool, CheckError> {
        match term {
            Term::All(_) => Ok(true),
            Term::Ip4(_, net, prefix) => Ok(match self.client_ip {
                IpAddr::V4(ip) => ipv4_in(ip, *net, *prefix),
                IpAddr::V6(_) => false,
            }),
            Term::Ip6(_, net, prefix) => Ok(match self.client_ip {
                IpAddr::V6(ip) => ipv6_in(ip, *net, *prefix),
                IpAddr::V4(_) => false,
            }),
            Term::A {
                domain: spec,
                v4_prefix,
                v6_prefix,
                ..
            } => {
                self.budget()?;
                let target = self.target_domain(spec.as_deref(), domain)?;
                self.address_match(&target, *v4_prefix, *v6_prefix).await
            }
            Term::Mx {
                domain: spec,
                v4_prefix,
                v6_prefix,
                ..
            } => {
                self.budget()?;
                let target = self.target_domain(spec.as_deref(), domain)?;
                let response = self
                    .resolver
                    .query_mx(&target)
                    .await
                    .map_err(|_| CheckError::Temp)?;
                self.count_void(&response)?;
                let exchanges: Vec<String> = response
                    .mx_records()
                    .take(MAX_NAMES_PER_MECHANISM)
                    .map(|(_, name)| name.to_string())
                    .collect();
                for exchange in exchanges {
                    if self.address_match(&exchange, *v4_prefix, *v6_prefix).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Term::Include(_, spec) => {
                self.budget()?;
                let target = self
                    .expand(spec, domain, false)
                    .map_err(|_| CheckError::Perm)?;
                match self.evaluate(target).await? {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(CheckError::Temp),
                    _ => Err(CheckError::Perm),
                }
            }
            Term::Exists(_, spec) => {
                self.budget()?;
                let target = self
                    .expand(spec, domain, false)
                    .map_err(|_| CheckError::Perm)?;
                let response = self
                    .resolver
                    .query_a(&target)
                    .await
                    .map_err(|_| CheckError::Temp)?;
                self.count_void(&response)?;
                let found = response.a_records().next().is_some();
                Ok(found)
            }
            Term::Ptr(_, spec) => {
                self.budget()?;
                let target = self.target_domain(spec.as_deref(), domain)?;
                let response = self
                    .resolver
                    .query_ptr(&reverse_name(self.client_ip))
                    .await
                    .map_err(|_| CheckError::Temp)?;
                self.count_void(&response)?;
                let names: Vec<String> = response
                    .ptr_records()
                    .take(MAX_NAMES_PER_MECHANISM)
                    .map(|n| n.trim_end_matches('.').to_string())
                    .collect();
                for name in names {
                    if !domain_suffix(&name, &target) {
                        continue;
                    }
                    // Forward-confirm the PTR name.
                    if self.address_match(&name, 32, 128).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Term::Redirect(_) | Term::Exp(_) | Term::UnknownModifier => Ok(false),
        }
    }

    fn target_domain(&self, spec: Option<&str>, domain: &str) -> Result<String, CheckError> {
        match spec {
            Some(spec) => self.expand(spec, domain, false).map_err(|_| CheckError::Perm),
            None => Ok(domain.to_string()),
        }
    }

    /// Does the target name resolve to an address covering the client IP?
    async fn address_match(
        &mut self,
        name: &str,
        v4_prefix: u8,
        v6_prefix: u8,
    ) -> Result<bool, CheckError> {
        match self.client_ip {
            IpAddr::V4(ip) => {
                let response = self
                    .resolver
                    .query_a(name)
                    .await
                    .map_err(|_| CheckError::Temp)?;
                self.count_void(&response)?;
                let found = response.a_records().any(|a| ipv4_in(ip, a, v4_prefix));
                Ok(found)
            }
            IpAddr::V6(ip) => {
                let response = self
                    .resolver
                    .query_aaaa(name)
                    .await
                    .map_err(|_| CheckError::Temp)?;
                self.count_void(&response)?;
                let found = response.aaaa_records().any(|a| ipv6_in(ip, a, v6_prefix));
                Ok(found)
            }
        }
    }

    /// Macro expansion per RFC 7208 §7.
    fn expand(&self, spec: &str, domain: &str, in_exp: bool) -> Result<String, ()> {
        let mut out = String::with_capacity(spec.len());
        let mut chars = spec.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('_') => out.push(' '),
                Some('-') => out.push_str("%20"),
                Some('{') => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => body.push(c),
                            None => return Err(()),
                        }
                    }
                    out.push_str(&self.expand_macro(&body, domain, in_exp)?);
                }
                _ => return Err(()),
            }
        }
        Ok(out)
    }

    fn expand_macro(&self, body: &str, domain: &str, in_exp: bool) -> Result<String, ()> {
        let mut chars = body.chars();
        let letter = chars.next().ok_or(())?;
        let rest: String = chars.collect();
        let upper = letter.is_ascii_uppercase();
        let value = match letter.to_ascii_lowercase() {
            's' => self.sender.clone(),
            'l' => self.local.clone(),
            'o' => self.sender_domain.clone(),
            'd' => domain.to_string(),
            'i' => macro_ip(self.client_ip),
            'v' => match self.client_ip {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            'h' => self.helo.clone(),
            'c' if in_exp => self.client_ip.to_string(),
            'r' if in_exp => "unknown".to_string(),
            't' if in_exp => chrono::Utc::now().timestamp().to_string(),
            _ => return Err(()),
        };

        // Transformers: an optional digit count, an optional 'r' (reverse),
        // then an optional delimiter set.
        let mut digits = String::new();
        let mut reverse = false;
        let mut delimiters = String::new();
        for c in rest.chars() {
            if c.is_ascii_digit() && delimiters.is_empty() && !reverse {
                digits.push(c);
            } else if (c == 'r' || c == 'R') && delimiters.is_empty() {
                reverse = true;
            } else if ".-+,/_=".contains(c) {
                delimiters.push(c);
            } else {
                return Err(());
            }
        }
        if delimiters.is_empty() {
            delimiters.push('.');
        }
        let mut labels: Vec<&str> = value
            .split(|c: char| delimiters.contains(c))
            .collect();
        if reverse {
            labels.reverse();
        }
        if !digits.is_empty() {
            let n: usize = digits.parse().map_err(|_| ())?;
            if n == 0 {
                return Err(());
            }
            if labels.len() > n {
                labels = labels[labels.len() - n..].to_vec();
            }
        }
        let joined = labels.join(".");
        if upper {
            Ok(url_escape(&joined))
        } else {
            Ok(joined)
        }
    }
}

fn qualifier_of(term: &Term) -> Qualifier {
    match term {
        Term::All(q)
        | Term::Ip4(q, _, _)
        | Term::Ip6(q, _, _)
        | Term::Include(q, _)
        | Term::Exists(q, _)
        | Term::Ptr(q, _) => *q,
        Term::A { qualifier, .. } | Term::Mx { qualifier, .. } => *qualifier,
        _ => Qualifier::Neutral,
    }
}

fn parse_record(record: &str) -> Option<Vec<Term>> {
    let mut terms = Vec::new();
    for token in record.split_whitespace().skip(1) {
        terms.push(parse_term(token)?);
    }
    Some(terms)
}

fn parse_term(token: &str) -> Option<Term> {
    let (qualifier, rest) = match token.chars().next()? {
        '+' => (Qualifier::Pass, &token[1..]),
        '-' => (Qualifier::Fail, &token[1..]),
        '~' => (Qualifier::SoftFail, &token[1..]),
        '?' => (Qualifier::Neutral, &token[1..]),
        _ => (Qualifier::Pass, token),
    };
    let lower = rest.to_lowercase();
    if lower == "all" {
        return Some(Term::All(qualifier));
    }
    if let Some(value) = strip_mechanism(rest, "ip4:") {
        let (addr, prefix) = split_cidr(value, 32)?;
        return Some(Term::Ip4(qualifier, addr.parse().ok()?, prefix));
    }
    if let Some(value) = strip_mechanism(rest, "ip6:") {
        let (addr, prefix) = split_cidr(value, 128)?;
        return Some(Term::Ip6(qualifier, addr.parse().ok()?, prefix));
    }
    if lower == "a" || lower.starts_with("a:") || lower.starts_with("a/") {
        let (domain, v4, v6) = parse_domain_cidr(&rest[1..])?;
        return Some(Term::A {
            qualifier,
            domain,
            v4_prefix: v4,
            v6_prefix: v6,
        });
    }
    if lower == "mx" || lower.starts_with("mx:") || lower.starts_with("mx/") {
        let (domain, v4, v6) = parse_domain_cidr(&rest[2..])?;
        return Some(Term::Mx {
            qualifier,
            domain,
            v4_prefix: v4,
            v6_prefix: v6,
        });
    }
    if let Some(value) = strip_mechanism(rest, "include:") {
        return Some(Term::Include(qualifier, value.to_string()));
    }
    if let Some(value) = strip_mechanism(rest, "exists:") {
        return Some(Term::Exists(qualifier, value.to_string()));
    }
    if lower == "ptr" {
        return Some(Term::Ptr(qualifier, None));
    }
    if let Some(value) = strip_mechanism(rest, "ptr:") {
        return Some(Term::Ptr(qualifier, Some(value.to_string())));
    }
    if let Some(value) = rest.strip_prefix("redirect=") {
        return Some(Term::Redirect(value.to_string()));
    }
    if let Some(value) = rest.strip_prefix("exp=") {
        return Some(Term::Exp(value.to_string()));
    }
    // Unknown modifiers (name=value) are ignored; unknown mechanisms are a
    // syntax error.
    if rest.contains('=') {
        return Some(Term::UnknownModifier);
    }
    None
}

fn strip_mechanism<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    if token.len() >= prefix.len() && token[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}

fn split_cidr(value: &str, max: u8) -> Option<(&str, u8)> {
    match value.split_once('/') {
        Some((addr, prefix)) => {
            let p: u8 = prefix.parse().ok()?;
            if p > max {
                return None;
            }
            Some((addr, p))
        }
        None => Some((value, max)),
    }
}

/// `[:domain][/v4-cidr][//v6-cidr]` after an `a` or `mx` mechanism name.
fn parse_domain_cidr(value: &str) -> Option<(Option<String>, u8, u8)> {
    let mut v6 = 128u8;
    let mut work = value;
    if let Some((head, tail)) = work.split_once("//") {
        v6 = tail.parse().ok()?;
        if v6 > 128 {
            return None;
        }
        work = head;
    }
    let mut v4 = 32u8;
    if let Some((head, tail)) = work.split_once('/') {
        v4 = tail.parse().ok()?;
        if v4 > 32 {
            return None;
        }
        work = head;
    }
    let domain = work.strip_prefix(':').map(|d| d.to_string());
    if domain.is_none() && !work.is_empty() {
        return None;
    }
    Some((domain, v4, v6))
}

fn ipv4_in(ip: Ipv4Addr, net: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

fn ipv6_in(ip: Ipv6Addr, net: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - prefix as u32);
    (u128::from(ip) & mask) == (u128::from(net) & mask)
}

/// Macro letter `i`: dotted quads for IPv4, dot-separated nibbles for IPv6.
fn macro_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => {
            let mut out = String::with_capacity(63);
            for (i, b) in ip.octets().iter().enumerate() {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(&format!("{:x}.{:x}", b >> 4, b & 0xf));
            }
            out
        }
    }
}

/// Reverse-DNS name for the client address; IPv6 per RFC 3596 §2.5.
fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(ip) => {
            let mut nibbles = Vec::with_capacity(32);
            for b in ip.octets() {
                nibbles.push(format!("{:x}", b >> 4));
                nibbles.push(format!("{:x}", b & 0xf));
            }
            nibbles.reverse();
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

fn domain_suffix(name: &str, target: &str) -> bool {
    let name = name.to_lowercase();
    let target = target.trim_end_matches('.').to_lowercase();
    name == target || name.ends_with(&format!(".{}", target))
}

fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        let unreserved = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~');
        if unreserved {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
