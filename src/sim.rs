//! Simulated bus driver and devices.
//!
//! Stands in for the real fieldbus driver in tests and in the demo binary.
//! Every simulated bus appends its lifecycle events to a process-wide
//! per-interface recorder, so tests can assert ordering (startup before
//! activation, deactivation before close) and scripts can inject open or
//! startup failures. Cyclic `update` calls are only counted, not recorded,
//! since a free-running polling thread produces thousands of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::bus::{BusDriver, BusError, UpdateMode};
use crate::device::Device;

/// Simulated bus cycle, also the pace of `StandaloneEnforceRate` updates.
const SIM_CYCLE: Duration = Duration::from_millis(1);
const SIM_CYCLE_NS: u64 = 1_000_000;

/// Lifecycle event of a simulated bus, in observation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BusEvent {
    Opened,
    Attached(String),
    Startup,
    Sync0 {
        address: u32,
        start_time_ns: u64,
        cycle_time_ns: u64,
    },
    PrioritySet(i32),
    Activated,
    Deactivated,
    Closed,
}

#[derive(Debug, Default)]
struct RecorderState {
    events: Vec<BusEvent>,
    update_count: u64,
    bus_time_ns: u64,
    fail_open: bool,
    fail_startup: bool,
}

/// Shared view on one interface's recorded bus activity.
#[derive(Clone, Default)]
pub struct SimBusRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl SimBusRecorder {
    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().events.clone()
    }

    pub fn update_count(&self) -> u64 {
        self.lock().update_count
    }

    /// Position of the first occurrence of `event`, if recorded.
    pub fn position_of(&self, event: &BusEvent) -> Option<usize> {
        self.lock().events.iter().position(|e| e == event)
    }

    pub fn count_of(&self, event: &BusEvent) -> usize {
        self.lock().events.iter().filter(|e| *e == event).count()
    }

    /// Make the next [`BusDriver::open`] on this interface fail.
    pub fn fail_next_open(&self) {
        self.lock().fail_open = true;
    }

    /// Make the next [`BusDriver::startup`] on this interface report failure.
    pub fn fail_next_startup(&self) {
        self.lock().fail_startup = true;
    }

    fn record(&self, event: BusEvent) {
        self.lock().events.push(event);
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn recorders() -> &'static Mutex<HashMap<String, SimBusRecorder>> {
    static RECORDERS: OnceLock<Mutex<HashMap<String, SimBusRecorder>>> = OnceLock::new();
    RECORDERS.get_or_init(Mutex::default)
}

/// The recorder for an interface, created on first use. Tests should use a
/// unique interface name each to stay isolated from one another.
pub fn recorder(interface: &str) -> SimBusRecorder {
    recorders()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(interface.to_string())
        .or_default()
        .clone()
}

/// Simulated fieldbus driver.
///
/// `startup`/`activate`/`deactivate` only flip state and record events; the
/// bus clock advances by one cycle per `update`. Closing the bus is the
/// drop of this struct, mirroring how a real driver releases its socket.
pub struct SimBus {
    interface: String,
    recorder: SimBusRecorder,
    active: bool,
}

impl BusDriver for SimBus {
    fn open(interface: &str) -> Result<Self, BusError> {
        let recorder = recorder(interface);
        if std::mem::take(&mut recorder.lock().fail_open) {
            return Err(BusError::Open {
                interface: interface.to_string(),
                reason: "scripted open failure".to_string(),
            });
        }

        recorder.record(BusEvent::Opened);
        debug!(interface, "simulated bus opened");
        Ok(Self {
            interface: interface.to_string(),
            recorder,
            active: false,
        })
    }

    fn name(&self) -> &str {
        &self.interface
    }

    fn attach(&mut self, device: &str) -> Result<(), BusError> {
        self.recorder.record(BusEvent::Attached(device.to_string()));
        Ok(())
    }

    fn startup(&mut self) -> bool {
        if std::mem::take(&mut self.recorder.lock().fail_startup) {
            return false;
        }
        self.recorder.record(BusEvent::Startup);
        true
    }

    fn activate(&mut self) -> bool {
        self.active = true;
        self.recorder.record(BusEvent::Activated);
        true
    }

    fn update(&mut self, mode: UpdateMode) {
        {
            let mut state = self.recorder.lock();
            state.update_count += 1;
            state.bus_time_ns += SIM_CYCLE_NS;
        }
        if mode == UpdateMode::StandaloneEnforceRate {
            thread::sleep(SIM_CYCLE);
        }
    }

    fn deactivate(&mut self) {
        if self.active {
            self.active = false;
            self.recorder.record(BusEvent::Deactivated);
        }
    }

    fn set_realtime_priority(&mut self, priority: i32) {
        self.recorder.record(BusEvent::PrioritySet(priority));
    }

    fn bus_time_ns(&self) -> u64 {
        self.recorder.lock().bus_time_ns
    }

    fn write_sync0_start(&mut self, address: u32, start_time_ns: u64, cycle_time_ns: u64) {
        self.recorder.record(BusEvent::Sync0 {
            address,
            start_time_ns,
            cycle_time_ns,
        });
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        self.recorder.record(BusEvent::Closed);
        debug!(interface = %self.interface, "simulated bus closed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimDeviceState {
    Idle,
    Operational,
    SafeState,
}

/// Simulated slave device (think: one servo drive).
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    dc_address: Option<u32>,
    fail_initialize: bool,
    state: SimDeviceState,
}

impl SimDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dc_address: None,
            fail_initialize: false,
            state: SimDeviceState::Idle,
        }
    }

    /// A device that participates in distributed-clock sync-0.
    pub fn with_dc_address(name: &str, address: u32) -> Self {
        Self {
            dc_address: Some(address),
            ..Self::new(name)
        }
    }

    /// Script the device to refuse initialization during startup.
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn state(&self) -> SimDeviceState {
        self.state
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> bool {
        if self.fail_initialize {
            return false;
        }
        self.state = SimDeviceState::Operational;
        true
    }

    fn dc_sync0_address(&self) -> Option<u32> {
        self.dc_address
    }

    fn enter_safe_state(&mut self) {
        self.state = SimDeviceState::SafeState;
    }
}
