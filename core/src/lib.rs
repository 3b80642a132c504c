/*
 * lib.rs
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

//! Staffetta core: non-blocking protocol clients over a selector-loop transport.
//!
//! The transport layer (`reactor`, `endpoint`) multiplexes many connections on a
//! small pool of single-threaded event loops; a connection is pinned to one loop
//! for its lifetime and all of its callbacks run serially on that loop's thread.
//! Protocol state machines (`protocol::smtp`, `protocol::imap`, `protocol::resp`)
//! are push parsers driven by the endpoint's `receive`, dispatching replies to the
//! callback registered for the in-flight command. `auth` layers SPF/DKIM/DMARC
//! checks over an injected async DNS resolver.

pub mod auth;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod net;
pub mod parse;
pub mod protocol;
pub mod reactor;
pub mod sasl;

pub use config::ReactorConfig;
pub use endpoint::{ConnectionHandler, Endpoint, EndpointHandle, EndpointOptions};
pub use error::{Error, ErrorKind};
pub use net::TlsInfo;
pub use reactor::{LoopHandle, Reactor};
