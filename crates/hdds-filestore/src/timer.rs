// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A cancellable, re-armable `AfterFunc`-style timer (§9 "Timers").
//!
//! Backs the cache-expiration timer (per segment), the sync timer and age
//! timer (per stream). A dedicated thread blocks on either a control
//! message or the deadline elapsing, so `reset` never races a fire that is
//! already in flight.

use crossbeam_channel::{after, select, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// What a fire callback wants to happen next.
pub enum TimerAction {
    /// Re-arm for another `Duration` from now.
    Reschedule(Duration),
    /// Stop the timer thread; it will not fire again.
    Stop,
}

enum Cmd {
    Reset(Duration),
    Stop,
}

/// A re-armable timer running on its own thread.
pub struct Timer {
    cmd_tx: Sender<Cmd>,
    join: Option<JoinHandle<()>>,
}

impl Timer {
    /// Starts the timer thread, firing `on_fire` first after `initial`.
    pub fn start<F>(initial: Duration, on_fire: F) -> Self
    where
        F: Fn() -> TimerAction + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();

        let join = std::thread::Builder::new()
            .name("hdds-filestore-timer".into())
            .spawn(move || {
                let mut wait = initial;
                loop {
                    select! {
                        recv(cmd_rx) -> msg => match msg {
                            Ok(Cmd::Reset(d)) => wait = d,
                            Ok(Cmd::Stop) | Err(_) => break,
                        },
                        recv(after(wait)) -> _ => {
                            match on_fire() {
                                TimerAction::Reschedule(d) => wait = d,
                                TimerAction::Stop => break,
                            }
                        }
                    }
                }
            })
            .expect("spawn timer thread");

        Self {
            cmd_tx,
            join: Some(join),
        }
    }

    /// Re-arms the timer to fire `d` from now, superseding any pending
    /// deadline.
    pub fn reset(&self, d: Duration) {
        let _ = self.cmd_tx.send(Cmd::Reset(d));
    }

    /// Cancels the timer and joins its thread.
    pub fn stop(mut self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
