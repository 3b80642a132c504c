/*
 * reactor.rs
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

//! Selector loop pool. Each loop is one OS thread running a current-thread
//! runtime; endpoints are pinned to a loop at creation and every callback for
//! a connection runs serially on that loop's thread (loop affinity). The
//! reactor is an explicit context object with a start/stop lifecycle; there is
//! no process-wide singleton and no auto-start.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::config::ReactorConfig;
use crate::error::Error;

enum LoopTask {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Handle to one selector loop. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopTask>,
    index: usize,
}

impl LoopHandle {
    /// Enqueue a task to run on this loop's thread on the next tick. Tasks run
    /// in submission order, interleaved with I/O events but never concurrently
    /// with them.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.tx
            .send(LoopTask::Run(Box::new(task)))
            .map_err(|_| Error::transport("selector loop stopped"))
    }

    /// Force the loop to return from its park immediately. Enqueuing any task
    /// wakes the loop; this enqueues a no-op.
    pub fn wakeup(&self) {
        let _ = self.tx.send(LoopTask::Run(Box::new(|| {})));
    }

    /// Index of this loop within its reactor.
    pub fn index(&self) -> usize {
        self.index
    }
}

struct SelectorLoop {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

/// A pool of selector loops with round-robin assignment.
pub struct Reactor {
    loops: Vec<SelectorLoop>,
    next: AtomicUsize,
}

impl Reactor {
    /// Start the configured number of loops. Each loop services its task queue
    /// and all endpoints registered on it until [`Reactor::stop`].
    pub fn start(config: ReactorConfig) -> Self {
        let count = config.loops.max(1);
        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            loops.push(Self::spawn_loop(index));
        }
        tracing::debug!(loops = count, "reactor started");
        Self {
            loops,
            next: AtomicUsize::new(0),
        }
    }

    fn spawn_loop(index: usize) -> SelectorLoop {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(format!("selector-loop-{}", index))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, index, "failed to build loop runtime");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(task) = rx.recv().await {
                        match task {
                            LoopTask::Run(f) => f(),
                            LoopTask::Shutdown => break,
                        }
                    }
                });
                tracing::debug!(index, "selector loop stopped");
            })
            .expect("spawn selector loop thread");
        SelectorLoop {
            handle: LoopHandle { tx, index },
            thread: Some(thread),
        }
    }

    /// Pick the next loop, round-robin. Endpoints bound to the returned loop
    /// stay on it for their whole lifetime.
    pub fn next_loop(&self) -> LoopHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].handle.clone()
    }

    /// Handles for all loops, in index order.
    pub fn loop_handles(&self) -> Vec<LoopHandle> {
        self.loops.iter().map(|l| l.handle.clone()).collect()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Stop every loop and join its thread. Endpoints still registered are
    /// dropped without further callbacks.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for l in &self.loops {
            let _ = l.handle.tx.send(LoopTask::Shutdown);
        }
        for l in &mut self.loops {
            if let Some(thread) = l.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
