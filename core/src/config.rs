/*
 * config.rs
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

//! Reactor configuration. The reactor is dependency-injected, never a
//! global; applications construct one config, start one reactor, and stop it
//! on shutdown. Per-connection tuning (TLS, buffer sizes) lives in
//! [`crate::endpoint::EndpointOptions`].

/// Configuration for [`crate::reactor::Reactor::start`].
#[derive(Clone)]
pub struct ReactorConfig {
    /// Number of selector loops. Defaults to the number of available cores.
    pub loops: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { loops: cores }
    }
}

impl ReactorConfig {
    pub fn with_loops(mut self, loops: usize) -> Self {
        self.loops = loops.max(1);
        self
    }
}
