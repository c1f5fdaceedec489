//! Adaptive concurrency limit for bulk collection operations.
//!
//! The controller hands out [`SlotPermit`]s from a pool whose size follows an
//! additive-increase / multiplicative-decrease rule driven by observed
//! latency. Waiters are queued FIFO and a slot released by one permit is
//! handed straight to the next waiter.

use futures::channel::oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

/// Settings for the adaptive concurrency controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencyOptions {
    pub enabled: bool,
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Number of latency samples per adjustment decision.
    pub sampling_window: usize,
    #[serde(alias = "targetLatency")]
    pub target_latency_ms: u64,
    /// Fraction used for both the decrease and the increase step, in `(0, 1)`.
    pub adjustment_factor: f64,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_concurrency: 4,
            min_concurrency: 1,
            max_concurrency: 16,
            sampling_window: 20,
            target_latency_ms: 100,
            adjustment_factor: 0.25,
        }
    }
}

impl ConcurrencyOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Clamps the options into a usable shape: `1 <= min <= max`, a
    /// non-empty window and a factor strictly between 0 and 1.
    fn normalized(mut self) -> Self {
        self.min_concurrency = self.min_concurrency.max(1);
        self.max_concurrency = self.max_concurrency.max(self.min_concurrency);
        self.initial_concurrency = self
            .initial_concurrency
            .clamp(self.min_concurrency, self.max_concurrency);
        self.sampling_window = self.sampling_window.max(1);
        if !(self.adjustment_factor > 0.0 && self.adjustment_factor < 1.0) {
            self.adjustment_factor = ConcurrencyOptions::default().adjustment_factor;
        }
        self
    }

    fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }
}

/// A point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyStats {
    pub enabled: bool,
    pub current_limit: usize,
    pub in_flight: usize,
    pub queued: usize,
    /// Mean latency of the last completed sampling window.
    pub mean_latency: Option<Duration>,
    pub adjustments: u64,
}

#[derive(Debug)]
struct ControllerState {
    options: ConcurrencyOptions,
    limit: usize,
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    samples: Vec<Duration>,
    last_mean: Option<Duration>,
    adjustments: u64,
}

impl ControllerState {
    fn new(options: ConcurrencyOptions) -> Self {
        let options = options.normalized();
        Self {
            limit: options.initial_concurrency,
            options,
            in_flight: 0,
            waiters: VecDeque::new(),
            samples: Vec::new(),
            last_mean: None,
            adjustments: 0,
        }
    }

    fn capacity(&self) -> usize {
        if self.options.enabled { self.limit } else { usize::MAX }
    }

    /// Hands free slots to queued waiters in arrival order.
    fn dispatch(&mut self) {
        while self.in_flight < self.capacity() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.in_flight += 1;
            }
        }
    }

    fn record(&mut self, latency: Duration) {
        if !self.options.enabled {
            return;
        }

        self.samples.push(latency);
        if self.samples.len() < self.options.sampling_window {
            return;
        }

        let count = self.samples.len();
        let total: Duration = self.samples.drain(..).sum();
        let mean = total.div_f64(count as f64);
        self.last_mean = Some(mean);
        self.adjust(mean);
    }

    fn adjust(&mut self, mean: Duration) {
        let target = self.options.target_latency();
        let factor = self.options.adjustment_factor;
        let (min, max) = (self.options.min_concurrency, self.options.max_concurrency);
        let limit = self.limit;

        let next = if mean > target {
            let reduced = (limit as f64 * (1.0 - factor)).floor() as usize;
            reduced.min(limit.saturating_sub(1)).max(min)
        } else if mean.as_secs_f64() < target.as_secs_f64() * (1.0 - factor) {
            let step = ((limit as f64 * factor).floor() as usize).max(1);
            limit.saturating_add(step).min(max)
        } else {
            limit
        };

        if next != limit {
            log::debug!(
                "concurrency limit {} -> {} (window mean {:?}, target {:?})",
                limit,
                next,
                mean,
                target
            );
            self.limit = next;
            self.adjustments += 1;
            self.dispatch();
        }
    }

    fn release(&mut self, latency: Option<Duration>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(latency) = latency {
            self.record(latency);
        }
        self.dispatch();
    }
}

/// AIMD-bounded slot pool. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    state: Arc<Mutex<ControllerState>>,
}

impl ConcurrencyController {
    pub fn new(options: ConcurrencyOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState::new(options))),
        }
    }

    /// Waits for a free slot. Dropping the returned permit frees the slot and
    /// records how long it was held.
    pub async fn acquire(&self) -> SlotPermit {
        let receiver = {
            let mut state = self.state.lock();
            if !state.options.enabled {
                return SlotPermit::unbounded();
            }
            if state.in_flight < state.limit && state.waiters.is_empty() {
                state.in_flight += 1;
                return SlotPermit::counted(self.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut waiter = QueuedWaiter {
            controller: self,
            receiver,
            granted: false,
        };

        match (&mut waiter.receiver).await {
            Ok(()) => {
                waiter.granted = true;
                SlotPermit::counted(self.clone())
            }
            Err(oneshot::Canceled) => {
                waiter.granted = true;
                SlotPermit::unbounded()
            }
        }
    }

    /// Feeds an externally measured latency sample into the current window.
    pub fn record_latency(&self, latency: Duration) {
        self.state.lock().record(latency);
    }

    pub fn options(&self) -> ConcurrencyOptions {
        self.state.lock().options.clone()
    }

    /// Replaces the options. The current limit is clamped into the new
    /// bounds, or reset to the new initial value when the controller is
    /// switched on.
    pub fn set_options(&self, options: ConcurrencyOptions) {
        let mut state = self.state.lock();
        let options = options.normalized();

        state.limit = if options.enabled && !state.options.enabled {
            options.initial_concurrency
        } else {
            state.limit.clamp(options.min_concurrency, options.max_concurrency)
        };
        state.options = options;
        state.samples.clear();
        state.dispatch();
    }

    pub fn current_limit(&self) -> usize {
        self.state.lock().limit
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.state.lock();
        ConcurrencyStats {
            enabled: state.options.enabled,
            current_limit: state.limit,
            in_flight: state.in_flight,
            queued: state.waiters.iter().filter(|waiter| !waiter.is_canceled()).count(),
            mean_latency: state.last_mean,
            adjustments: state.adjustments,
        }
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(ConcurrencyOptions::default())
    }
}

/// Returns a slot that was handed over after the waiting future was dropped.
struct QueuedWaiter<'a> {
    controller: &'a ConcurrencyController,
    receiver: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.receiver.close();
        if let Ok(Some(())) = self.receiver.try_recv() {
            self.controller.state.lock().release(None);
        }
    }
}

/// A held concurrency slot.
#[derive(Debug)]
pub struct SlotPermit {
    controller: Option<ConcurrencyController>,
    started: Instant,
}

impl SlotPermit {
    fn counted(controller: ConcurrencyController) -> Self {
        Self {
            controller: Some(controller),
            started: Instant::now(),
        }
    }

    fn unbounded() -> Self {
        Self {
            controller: None,
            started: Instant::now(),
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.state.lock().release(Some(self.started.elapsed()));
        }
    }
}
