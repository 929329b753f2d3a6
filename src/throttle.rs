//! Admission control for HTTP.
//!
//! The [HttpThrottle] counts requests holding an HTTP slot. Once the count reaches the high water mark the gate
//! closes, and it stays closed until the count drops below the low water mark. At that point every free slot is
//! handed out at once, so parked requests wake in a batch rather than one per finished transfer.
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::request::FetchRequest;
use crate::AssetId;

#[derive(Debug, Clone)]
pub struct HttpThrottle {
    low_water: usize,
    high_water: usize,
    in_flight: usize,
    gate_open: bool,
}

impl HttpThrottle {
    pub fn new(low_water: usize, high_water: usize) -> HttpThrottle {
        assert!(high_water > 0, "high water mark must be positive");
        assert!(low_water <= high_water, "low water mark must not exceed the high water mark");
        HttpThrottle {
            low_water,
            high_water,
            in_flight: 0,
            gate_open: true,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_open(&self) -> bool {
        self.gate_open
    }

    /// Slots that may be handed out right now.
    pub fn available(&self) -> usize {
        if self.gate_open {
            self.high_water.saturating_sub(self.in_flight)
        } else {
            0
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.available() == 0 {
            return false;
        }
        self.in_flight += 1;
        if self.in_flight >= self.high_water {
            self.gate_open = false;
        }
        true
    }

    /// Return a slot. Returns how many slots are now available.
    pub fn release(&mut self) -> usize {
        debug_assert!(self.in_flight > 0, "released more slots than were acquired");
        self.in_flight = self.in_flight.saturating_sub(1);
        if !self.gate_open && self.in_flight < self.low_water.max(1) {
            self.gate_open = true;
        }
        self.available()
    }
}

/// The network bookkeeping: the throttle plus the requests parked waiting for a slot.
pub(crate) struct NetworkQueue {
    throttle: HttpThrottle,
    waiting: HashMap<AssetId, Arc<FetchRequest>, RandomState>,
}

impl NetworkQueue {
    pub fn new(low_water: usize, high_water: usize) -> NetworkQueue {
        NetworkQueue {
            throttle: HttpThrottle::new(low_water, high_water),
            waiting: Default::default(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.throttle.in_flight()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Give `request` a slot, or park it until one frees up. Returns whether it got one.
    ///
    /// A cancelled request neither gets a slot nor is parked.
    pub fn acquire_or_park(&mut self, request: &Arc<FetchRequest>) -> bool {
        if request.is_deleted() {
            return false;
        }
        if self.throttle.try_acquire() {
            request.grant_http_slot();
            return true;
        }
        self.waiting.insert(request.id, request.clone());
        false
    }

    /// Return a slot, handing any now free slots to the highest priority parked requests, which are returned so that
    /// the caller can put them back on the worker queue.
    pub fn release(&mut self) -> Vec<Arc<FetchRequest>> {
        let available = self.throttle.release();
        if available == 0 || self.waiting.is_empty() {
            return vec![];
        }

        self.waiting.retain(|_, r| !r.is_deleted());
        let mut candidates = self.waiting.values().cloned().collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
        let mut granted = Vec::with_capacity(available.min(candidates.len()));
        for request in candidates {
            if !self.throttle.try_acquire() {
                break;
            }
            self.waiting.remove(&request.id);
            request.grant_http_slot();
            granted.push(request);
        }
        tracing::trace!(granted = granted.len(), "released parked HTTP requests");
        granted
    }

    /// Forget a parked request. Only removes the entry if it belongs to the same request instance.
    pub fn remove_waiting(&mut self, request: &FetchRequest) -> bool {
        match self.waiting.get(&request.id) {
            Some(r) if r.serial == request.serial => {
                self.waiting.remove(&request.id);
                true
            }
            _ => false,
        }
    }
}
