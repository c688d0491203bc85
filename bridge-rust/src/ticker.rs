//! Repeating timer with a shutdown signal.
//!
//! Every long-lived loop (stream polling, pipeline tick, relay receive) owns a
//! `watch::Receiver<bool>` cloned from one `Shutdown`; flipping it to `true`
//! ends them all.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Owner side of the shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` reads `true` (or its sender is gone).
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct RepeatingTimer {
    interval: Interval,
    shutdown: watch::Receiver<bool>,
}

impl RepeatingTimer {
    pub fn new(period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let mut interval = interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, shutdown }
    }

    /// Wait for the next period. Returns `false` once shutdown was signalled.
    pub async fn tick(&mut self) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        let ticked = tokio::select! {
            _ = self.interval.tick() => true,
            _ = wait_for_shutdown(&mut self.shutdown) => false,
        };
        ticked && !*self.shutdown.borrow()
    }
}
