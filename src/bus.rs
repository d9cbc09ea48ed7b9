use thiserror::Error;

/// Pacing of a single [`BusDriver::update`] exchange cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// The driver enforces the configured cycle rate itself. Used by the
    /// registry polling thread, which free-runs without sleeping.
    StandaloneEnforceRate,
    /// The caller paces the cycle.
    NonStandalone,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to open bus on interface {interface}: {reason}")]
    Open { interface: String, reason: String },
    #[error("failed to register device {device} with the bus")]
    Attach { device: String },
}

/// Narrow contract of the low-level fieldbus driver.
///
/// The driver owns the raw socket, performs slave discovery and state
/// transitions, and exchanges process data. Everything above it (shared
/// lifecycle, barrier-gated activation, polling threads) is this crate;
/// everything below it is out of scope and consumed only through this trait.
///
/// The two clock operations exist so the master can arm distributed-clock
/// sync-0 during startup: `bus_time_ns` reads the master-observed bus time
/// and `write_sync0_start` programs one slave's sync-start register.
pub trait BusDriver: Send + Sized + 'static {
    /// Open the bus bound to a network interface.
    fn open(interface: &str) -> Result<Self, BusError>;

    /// Human-readable name of the bus (usually the interface name).
    fn name(&self) -> &str;

    /// Register a device with the bus. Must happen before [`startup`].
    ///
    /// [`startup`]: BusDriver::startup
    fn attach(&mut self, device: &str) -> Result<(), BusError>;

    /// Scan the bus and bring all slaves to a pre-operational state.
    /// Returns `false` on driver-level failure; the caller must not proceed
    /// to cyclic operation.
    fn startup(&mut self) -> bool;

    /// Transition the slaves to the operational state.
    fn activate(&mut self) -> bool;

    /// Perform exactly one process-data exchange cycle.
    fn update(&mut self, mode: UpdateMode);

    /// Leave the operational state. Safe to call repeatedly.
    fn deactivate(&mut self);

    /// Request real-time scheduling for the thread that will call `update`.
    fn set_realtime_priority(&mut self, priority: i32);

    /// Current bus time in nanoseconds, as observed by the master.
    fn bus_time_ns(&self) -> u64;

    /// Program one slave's DC sync-0 start register with a common future
    /// start time and cycle period.
    fn write_sync0_start(&mut self, address: u32, start_time_ns: u64, cycle_time_ns: u64);
}
