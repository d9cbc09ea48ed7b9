//! # EtherCAT master lifecycle manager
//!
//! Shared-ownership lifecycle management for a real-time EtherCAT master:
//! multiple independent consumers (e.g. separate hardware interfaces in one
//! process) drive devices on the *same* physical bus without each of them
//! opening and polling it redundantly.
//!
//! ## Features
//!
//! - **Master registry**: one master per network interface, exact reference
//!   counting across consumers, race-free teardown from any consumer
//! - **Barrier-gated activation**: the bus only goes live once every
//!   consumer has marked its handle ready
//! - **Real-time polling**: one dedicated polling thread per active bus,
//!   running at an elevated scheduling priority
//! - **Graceful teardown**: abort, join, drive devices to a safe state,
//!   close the bus, in that order, exactly once
//! - **Distributed clocks**: common sync-0 start time armed across all
//!   DC-capable devices during startup
//!
//! ## Quick start
//!
//! ```rust
//! use ecat_master::{device, MasterConfiguration, MasterRegistry};
//! use ecat_master::sim::{SimBus, SimDevice};
//!
//! let registry = MasterRegistry::<SimBus>::new();
//! let config = MasterConfiguration::for_interface("sim0");
//!
//! // Acquire a claim on the shared master and attach a device.
//! let handle = registry.acquire_default(&config);
//! {
//!     let mut master = handle.master().lock().unwrap();
//!     master.create_bus().unwrap();
//!     master.attach_device(device::shared(SimDevice::new("drive"))).unwrap();
//! }
//!
//! // The last consumer to arrive activates the bus and starts polling.
//! assert!(registry.mark_ready(&handle).unwrap());
//!
//! // The last release tears the master down again.
//! assert!(registry.release(&handle).unwrap());
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] - shared-lifecycle coordinator, handles, polling threads
//! - [`master`] - per-bus state machine (configure, attach, startup,
//!   update, shutdown)
//! - [`bus`] - narrow contract of the low-level fieldbus driver
//! - [`device`] - slave device capability contract
//! - [`config`] - master configuration and sharing key
//! - [`sim`] - simulated driver and devices for tests and demos
//!
//! The wire-level fieldbus protocol itself lives behind the [`bus::BusDriver`]
//! trait and is not part of this crate.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod device;
pub mod master;
pub mod registry;
pub mod sim;

// Re-export the main public types for convenience
pub use bus::{BusDriver, BusError, UpdateMode};
pub use config::MasterConfiguration;
pub use device::{Device, SharedDevice};
pub use master::{Master, MasterError};
pub use registry::{Handle, MasterRegistry, RegistryError, SharedMaster, DEFAULT_RT_PRIORITY};
