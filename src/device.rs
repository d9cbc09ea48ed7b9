use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Capability contract of an EtherCAT slave device.
///
/// Devices are created by consumer code (a hardware interface, a test, the
/// demo binary) and handed to a [`Master`](crate::master::Master), which
/// drives them through startup, cyclic exchange and shutdown. The device
/// itself keeps whatever PDO/SDO mapping state it needs; none of that is
/// visible here.
pub trait Device: Send {
    /// Unique name of the device within its master.
    fn name(&self) -> &str;

    /// Bring the device to its initial operational parameters. Called once
    /// during master startup, after the bus reached a pre-operational state.
    /// Returning `false` aborts the startup attempt.
    fn initialize(&mut self) -> bool;

    /// Slave address to program for distributed-clock sync-0, if the device
    /// supports it.
    fn dc_sync0_address(&self) -> Option<u32> {
        None
    }

    /// Drop the device to a safe, non-actuating state. Invoked by
    /// `pre_shutdown` before the bus is closed, and must tolerate being
    /// called after a partial startup.
    fn enter_safe_state(&mut self);
}

/// Shared-ownership alias for devices: a device is referenced both by the
/// master that drives it and by the code that created it.
pub type SharedDevice = Arc<Mutex<dyn Device>>;

/// Wrap a concrete device for attachment to a master.
pub fn shared<D: Device + 'static>(device: D) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Lock a shared device, continuing through poisoning: a device whose holder
/// panicked must still be driven to a safe state during teardown.
pub(crate) fn lock_device(device: &SharedDevice) -> MutexGuard<'_, dyn Device + 'static> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}
