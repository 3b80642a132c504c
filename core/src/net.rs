/*
 * net.rs
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

//! TLS client configuration. The endpoint drives the rustls engine directly
//! (unwrap on read, wrap on write, explicit handshake state); this module only
//! builds the client configuration and describes negotiated sessions.

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// Default TLS client config (native + Mozilla roots, no client auth).
pub fn default_client_config() -> Arc<ClientConfig> {
    static DEFAULT: std::sync::OnceLock<Arc<ClientConfig>> = std::sync::OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            let config = ClientConfig::builder()
                .with_root_certificates(build_root_store())
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// Parameters of an established TLS session, reported to
/// `ConnectionHandler::security_established`.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Negotiated protocol version (e.g. "TLSv1_3").
    pub protocol: Option<String>,
    /// Negotiated cipher suite name.
    pub cipher_suite: Option<String>,
    /// Negotiated ALPN protocol, when any was offered.
    pub alpn: Option<Vec<u8>>,
}
