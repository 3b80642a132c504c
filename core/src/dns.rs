/*
 * dns.rs
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

//! Asynchronous resolver interface consumed by the email authentication
//! pipeline. Packet encoding/decoding is somebody else's job: implementors
//! adapt whatever resolver the application embeds, and the pipeline only
//! sees rcodes and parsed resource records.
//!
//! A transport-level resolver failure (timeout, SERVFAIL from the upstream)
//! is an `Err` with kind `DnsTempFail`; NXDOMAIN and empty answers are `Ok`
//! responses that the caller inspects.

use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use crate::error::Error;

/// DNS response code, reduced to what the auth pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    ServFail,
    Other(u16),
}

/// One parsed resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Character strings of one TXT record, already concatenated.
    Txt(String),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Mx { preference: u16, exchange: String },
    Ptr(String),
}

/// Parsed DNS answer: rcode plus the records of the answer section.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub rcode: Rcode,
    pub records: Vec<Record>,
}

impl DnsResponse {
    pub fn nxdomain() -> Self {
        Self {
            rcode: Rcode::NxDomain,
            records: Vec::new(),
        }
    }

    pub fn answer(records: Vec<Record>) -> Self {
        Self {
            rcode: Rcode::NoError,
            records,
        }
    }

    /// True when the lookup produced no usable answer (NXDOMAIN or an empty
    /// answer section), a "void lookup" for the SPF budget.
    pub fn is_void(&self) -> bool {
        self.rcode == Rcode::NxDomain || self.records.is_empty()
    }

    pub fn txt_strings(&self) -> impl Iterator<Item = &str> {
        self.records.iter().filter_map(|r| match r {
            Record::Txt(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn a_records(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.records.iter().filter_map(|r| match r {
            Record::A(a) => Some(*a),
            _ => None,
        })
    }

    pub fn aaaa_records(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        self.records.iter().filter_map(|r| match r {
            Record::Aaaa(a) => Some(*a),
            _ => None,
        })
    }

    pub fn mx_records(&self) -> impl Iterator<Item = (u16, &str)> {
        self.records.iter().filter_map(|r| match r {
            Record::Mx {
                preference,
                exchange,
            } => Some((*preference, exchange.as_str())),
            _ => None,
        })
    }

    pub fn ptr_records(&self) -> impl Iterator<Item = &str> {
        self.records.iter().filter_map(|r| match r {
            Record::Ptr(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Asynchronous resolver. All methods run on the caller's task; the email
/// authentication pipeline invokes them from the connection's selector loop,
/// so implementations must not block.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn query_txt(&self, name: &str) -> Result<DnsResponse, Error>;

    async fn query_a(&self, name: &str) -> Result<DnsResponse, Error>;

    async fn query_aaaa(&self, name: &str) -> Result<DnsResponse, Error>;

    async fn query_mx(&self, name: &str) -> Result<DnsResponse, Error>;

    async fn query_ptr(&self, name: &str) -> Result<DnsResponse, Error>;
}
