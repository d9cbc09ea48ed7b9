use crate::bus::{BusDriver, BusError, UpdateMode};
use crate::config::MasterConfiguration;
use crate::device::{lock_device, SharedDevice};
use heapless::Vec;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on devices per master.
pub const MAX_DEVICES: usize = 32;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("bus was not created yet (call create_bus before attaching devices)")]
    BusNotCreated,
    #[error("bus driver error: {0}")]
    Bus(#[from] BusError),
    #[error("device table is full")]
    DeviceTableFull,
}

/// One EtherCAT master: a bus driver plus the devices attached to it.
///
/// Lifecycle: constructed empty → [`load_configuration`] → [`create_bus`] →
/// [`attach_device`]* → [`startup`] → [`update`]* → [`pre_shutdown`] →
/// [`shutdown`]. The registry owns the cyclic part of that sequence; `update`
/// is only ever called from a master's single polling thread (or by the
/// caller itself after [`startup_standalone`]).
///
/// [`load_configuration`]: Master::load_configuration
/// [`create_bus`]: Master::create_bus
/// [`attach_device`]: Master::attach_device
/// [`startup`]: Master::startup
/// [`startup_standalone`]: Master::startup_standalone
/// [`update`]: Master::update
/// [`pre_shutdown`]: Master::pre_shutdown
/// [`shutdown`]: Master::shutdown
pub struct Master<B: BusDriver> {
    bus: Option<B>,
    devices: Vec<SharedDevice, MAX_DEVICES>,
    configuration: MasterConfiguration,
    activated: bool,
}

impl<B: BusDriver> Master<B> {
    pub fn new() -> Self {
        Self {
            bus: None,
            devices: Vec::new(),
            configuration: MasterConfiguration::default(),
            activated: false,
        }
    }

    /// Store the configuration. No side effects on the bus.
    pub fn load_configuration(&mut self, configuration: MasterConfiguration) {
        self.configuration = configuration;
    }

    pub fn configuration(&self) -> &MasterConfiguration {
        &self.configuration
    }

    /// Open the bus driver on the configured network interface.
    ///
    /// Several consumers may share one master and each call this defensively;
    /// a second call on an already open bus is a no-op.
    pub fn create_bus(&mut self) -> Result<(), MasterError> {
        if self.bus.is_some() {
            debug!(
                interface = %self.configuration.network_interface,
                "bus already created, reusing it"
            );
            return Ok(());
        }

        let bus = B::open(&self.configuration.network_interface)?;
        info!(interface = %self.configuration.network_interface, "created bus");
        self.bus = Some(bus);
        Ok(())
    }

    /// Register a device with the bus.
    ///
    /// Returns `Ok(false)` if a device with the same name is already
    /// attached. Devices must be attached after [`create_bus`] and before
    /// [`startup`].
    ///
    /// [`create_bus`]: Master::create_bus
    /// [`startup`]: Master::startup
    pub fn attach_device(&mut self, device: SharedDevice) -> Result<bool, MasterError> {
        let name = lock_device(&device).name().to_string();

        if self.device_exists(&name) {
            warn!(device = %name, "a device with this name is already attached");
            return Ok(false);
        }

        let bus = self.bus.as_mut().ok_or(MasterError::BusNotCreated)?;
        bus.attach(&name)?;

        self.devices
            .push(device)
            .map_err(|_| MasterError::DeviceTableFull)?;

        info!(
            device = %name,
            interface = %self.configuration.network_interface,
            "attached device"
        );
        Ok(true)
    }

    fn device_exists(&self, name: &str) -> bool {
        self.devices
            .iter()
            .any(|device| lock_device(device).name() == name)
    }

    /// Bring the bus and all attached devices to an operational-ready state
    /// and arm distributed-clock sync-0 across all DC-capable devices.
    ///
    /// Returns `Ok(false)` on a driver- or device-level refusal; the caller
    /// must not proceed to cyclic polling in that case.
    pub fn startup(&mut self) -> Result<bool, MasterError> {
        self.startup_internal(false)
    }

    /// Like [`startup`], but also activates the bus so the caller can run
    /// its own `update` pacing without registry supervision.
    ///
    /// [`startup`]: Master::startup
    pub fn startup_standalone(&mut self) -> Result<bool, MasterError> {
        self.startup_internal(true)
    }

    fn startup_internal(&mut self, standalone: bool) -> Result<bool, MasterError> {
        {
            let bus = self.bus.as_mut().ok_or(MasterError::BusNotCreated)?;
            if !bus.startup() {
                warn!(
                    interface = %self.configuration.network_interface,
                    "bus driver refused startup"
                );
                return Ok(false);
            }
        }

        for device in &self.devices {
            let mut device = lock_device(device);
            if !device.initialize() {
                warn!(device = %device.name(), "device failed to initialize");
                return Ok(false);
            }
        }

        let mut addresses: Vec<u32, MAX_DEVICES> = Vec::new();
        for device in &self.devices {
            if let Some(address) = lock_device(device).dc_sync0_address() {
                // Cannot overflow, the device table has the same capacity.
                let _ = addresses.push(address);
            }
        }
        self.sync_distributed_clock0(&addresses);

        if standalone && !self.activate() {
            return Ok(false);
        }
        Ok(true)
    }

    /// Write a common future start time into every given slave's sync-0
    /// start register, so all slaves begin their cyclic pulses at the same
    /// instant. One-time step during startup, not repeated per cycle.
    fn sync_distributed_clock0(&mut self, addresses: &[u32]) {
        if addresses.is_empty() {
            return;
        }
        let Some(bus) = self.bus.as_mut() else {
            return;
        };

        let start_time_ns =
            bus.bus_time_ns() + self.configuration.dc_sync0_activation_delay_ns;
        for &address in addresses {
            bus.write_sync0_start(address, start_time_ns, self.configuration.time_step_ns);
        }
        info!(
            slaves = addresses.len(),
            start_time_ns, "armed distributed-clock sync-0"
        );
    }

    /// Transition the slaves to the operational state.
    pub fn activate(&mut self) -> bool {
        match self.bus.as_mut() {
            Some(bus) => {
                let activated = bus.activate();
                if activated {
                    self.activated = true;
                    info!(bus = %bus.name(), "activated bus");
                }
                activated
            }
            None => false,
        }
    }

    /// Leave the operational state. Safe to call repeatedly.
    pub fn deactivate(&mut self) {
        if let Some(bus) = self.bus.as_mut() {
            bus.deactivate();
        }
        self.activated = false;
    }

    /// Perform exactly one bus exchange cycle. Single-threaded per master;
    /// the registry guarantees the polling thread is the only cyclic caller.
    pub fn update(&mut self, mode: UpdateMode) {
        if let Some(bus) = self.bus.as_mut() {
            bus.update(mode);
        }
    }

    /// Forwarded to the driver for the thread that will call [`update`]
    /// repeatedly; invoked once by the polling thread before its first cycle.
    ///
    /// [`update`]: Master::update
    pub fn set_realtime_priority(&mut self, priority: i32) {
        if let Some(bus) = self.bus.as_mut() {
            bus.set_realtime_priority(priority);
        }
    }

    /// Request all devices to move to a safe, non-actuating state.
    /// Idempotent, and tolerates a partially failed startup.
    pub fn pre_shutdown(&mut self) {
        for device in &self.devices {
            lock_device(device).enter_safe_state();
        }
    }

    /// Close the bus. Idempotent; the driver socket is released on drop.
    pub fn shutdown(&mut self) {
        if let Some(mut bus) = self.bus.take() {
            bus.deactivate();
            info!(
                interface = %self.configuration.network_interface,
                "closed bus"
            );
        }
        self.activated = false;
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn bus_name(&self) -> Option<&str> {
        self.bus.as_ref().map(BusDriver::name)
    }

    pub fn device_names(&self) -> std::vec::Vec<String> {
        self.devices
            .iter()
            .map(|device| lock_device(device).name().to_string())
            .collect()
    }
}

impl<B: BusDriver> Default for Master<B> {
    fn default() -> Self {
        Self::new()
    }
}
