use std::collections::HashMap;

use log::{debug, info, warn};

use crate::models::DeviceHandle;
use super::registers::MeterType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Queue empty, nothing outstanding
    Idle,
    /// Queue has entries, the next request is about to go out
    Draining,
    /// One request sent, waiting for its response
    Awaiting { register: u16, requested_at: u64 },
}

/// Register polling state of one meter.
#[derive(Debug, Clone)]
pub struct PollState {
    pub meter_type: MeterType,
    pub read_queue: Vec<u16>,
    pub last_response: Option<u64>,
    pub phase: PollPhase,
}

impl PollState {
    pub fn new(meter_type: MeterType) -> Self {
        return PollState {
            meter_type,
            read_queue: Vec::new(),
            last_response: None,
            phase: PollPhase::Idle,
        };
    }

    fn is_stale(&self, now: u64, stale_after: u64) -> bool {
        match self.last_response {
            Some(t) => now.saturating_sub(t) > stale_after,
            None => true,
        }
    }

    fn refill(&mut self) {
        self.read_queue = self.meter_type.poll_registers().to_vec();
        self.phase = PollPhase::Draining;
    }

    /* Pops from the end of the queue */
    fn drain(&mut self, now: u64) -> Option<u16> {
        match self.read_queue.pop() {
            Some(register) => {
                self.phase = PollPhase::Awaiting { register, requested_at: now };
                Some(register)
            },
            None => {
                self.phase = PollPhase::Idle;
                None
            },
        }
    }

    pub fn outstanding(&self) -> Option<u16> {
        match self.phase {
            PollPhase::Awaiting { register, .. } => Some(register),
            _ => None,
        }
    }
}

/// What happened to the scheduler when a response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No request was outstanding, the scheduler state is unchanged
    Ignored,
    /// The response completed a request, the given register is requested next
    Next(u16),
    /// The response completed the last request of the cycle
    Finished,
}

/// Keeps at most one outstanding register request per device.
pub struct RegisterScheduler {
    devices: HashMap<DeviceHandle, PollState>,
    stale_after: u64,
}

impl RegisterScheduler {
    pub fn new(stale_after: u64) -> Self {
        return RegisterScheduler {
            devices: HashMap::new(),
            stale_after,
        };
    }

    pub fn track(&mut self, handle: DeviceHandle, meter_type: MeterType) {
        if self.devices.contains_key(&handle) {
            return;
        }
        debug!("Tracking {handle} as {:?}", meter_type);
        self.devices.insert(handle, PollState::new(meter_type));
    }

    pub fn forget(&mut self, handle: DeviceHandle) {
        if self.devices.remove(&handle).is_some() {
            info!("Stopped polling {handle}");
        }
    }

    pub fn is_tracked(&self, handle: DeviceHandle) -> bool {
        return self.devices.contains_key(&handle);
    }

    pub fn state(&self, handle: DeviceHandle) -> Option<&PollState> {
        return self.devices.get(&handle);
    }

    pub fn outstanding(&self, handle: DeviceHandle) -> Option<u16> {
        return self.devices.get(&handle).and_then(|s| s.outstanding());
    }

    pub fn pending(&self, handle: DeviceHandle) -> usize {
        return self.devices.get(&handle).map(|s| s.read_queue.len()).unwrap_or(0);
    }

    /// Periodic tick, returns the register to request now, if any.
    ///
    /// An idle device is refilled once its last response is older than the
    /// staleness interval. A request left unanswered for that long is
    /// abandoned and the device starts a new cycle.
    pub fn tick(&mut self, handle: DeviceHandle, now: u64) -> Option<u16> {
        let stale_after = self.stale_after;
        let state = self.devices.get_mut(&handle)?;

        match state.phase {
            PollPhase::Awaiting { register, requested_at } => {
                if now.saturating_sub(requested_at) <= stale_after {
                    return None;
                }
                warn!("{handle}: no response for register {register} within {stale_after}s, starting over");
                state.refill();
            },
            PollPhase::Idle => {
                if !state.read_queue.is_empty() {
                    state.phase = PollPhase::Draining;
                } else if state.is_stale(now, stale_after) {
                    debug!("{handle}: refreshing all registers");
                    state.refill();
                } else {
                    return None;
                }
            },
            PollPhase::Draining => {},
        }

        return state.drain(now);
    }

    /// A response (or acknowledge) arrived for `handle`.
    pub fn on_response(&mut self, handle: DeviceHandle, now: u64) -> ResponseOutcome {
        let state = match self.devices.get_mut(&handle) {
            Some(s) => s,
            None => return ResponseOutcome::Ignored,
        };

        if state.outstanding().is_none() {
            debug!("{handle}: response without outstanding request ignored");
            return ResponseOutcome::Ignored;
        }

        state.last_response = Some(now);
        state.phase = PollPhase::Draining;
        match state.drain(now) {
            Some(register) => ResponseOutcome::Next(register),
            None => ResponseOutcome::Finished,
        }
    }
}
