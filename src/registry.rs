//! Shared-lifecycle coordinator for EtherCAT masters.
//!
//! Several independent consumers (e.g. separate hardware interfaces in the
//! same process) drive devices on the same physical bus. The registry maps
//! each network interface to exactly one [`Master`], counts the outstanding
//! [`Handle`]s on it, and gates bus activation behind an all-must-arrive
//! barrier: only once every handle has been marked ready does the bus start
//! up and its dedicated real-time polling thread spin.
//!
//! Lock order is registry before master; the polling thread never takes the
//! registry lock, which is what makes joining it under that lock safe.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bus::{BusDriver, UpdateMode};
use crate::config::MasterConfiguration;
use crate::master::{Master, MasterError};

/// Default real-time priority for polling threads. Deliberately below the
/// scheduler maximum of 99 so kernel housekeeping threads are not starved.
pub const DEFAULT_RT_PRIORITY: i32 = 48;

/// A master shared between the registry, its polling thread and consumers.
pub type SharedMaster<B> = Arc<Mutex<Master<B>>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no master for interface {interface} is managed by this registry")]
    NotManaged { interface: String },
    #[error("handle {id} on interface {interface} was already marked as ready")]
    AlreadyReady { id: u32, interface: String },
    #[error("could not start up the master on interface {interface}")]
    Startup { interface: String },
    #[error("failed to spawn polling thread for interface {interface}: {source}")]
    Spawn {
        interface: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Master(#[from] MasterError),
}

/// One consumer's claim on a shared master.
///
/// The id comes from the owning entry's monotonic sequence: unique only
/// within one master's lifetime and reused across masters, but never reissued
/// while that master lives (the reference count guards lifetime, the id
/// sequence guards identity, and the two move independently). Handles are
/// immutable once issued and deliberately not `Clone`: one handle, one
/// [`release`](MasterRegistry::release).
pub struct Handle<B: BusDriver> {
    id: u32,
    interface: String,
    master: SharedMaster<B>,
}

impl<B: BusDriver> Handle<B> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The shared master this handle is bound to. Used to create the bus and
    /// attach devices between acquisition and readiness.
    pub fn master(&self) -> &SharedMaster<B> {
        &self.master
    }
}

struct RegistryEntry<B: BusDriver> {
    master: SharedMaster<B>,
    poll_thread: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    /// Outstanding handles; reaching zero triggers teardown. Never reused as
    /// an id source, a released-and-reacquired master must not hand a live
    /// handle's id to a newcomer.
    reference_count: i32,
    /// Monotonic id sequence, only ever incremented.
    next_id: u32,
    handles_ready: BTreeMap<u32, bool>,
    rt_priority: i32,
}

/// Process-wide coordinator mapping network interfaces to masters.
///
/// Constructed explicitly and passed around by `Arc` instead of hiding
/// behind a global, so teardown order stays testable. Dropping the registry
/// tears down every remaining master (abort all polling threads, join them,
/// then pre-shutdown and shutdown each bus).
pub struct MasterRegistry<B: BusDriver> {
    entries: Mutex<HashMap<String, RegistryEntry<B>>>,
}

impl<B: BusDriver> MasterRegistry<B> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a handle on the master for `configuration.network_interface`,
    /// creating the master on first acquisition and reusing it afterwards.
    ///
    /// Every acquisition for the same interface, concurrent or sequential,
    /// resolves to the same master instance. If the stored configuration
    /// differs from `configuration` this is reported as a warning and the
    /// existing master wins: keeping a running real-time bus beats aborting
    /// the other tenants over a mismatch.
    pub fn acquire(
        &self,
        configuration: &MasterConfiguration,
        rt_priority: i32,
    ) -> Handle<B> {
        let mut entries = self.lock_entries();
        let interface = configuration.network_interface.clone();

        let entry = entries.entry(interface.clone()).or_insert_with(|| {
            info!(interface = %interface, "setting up new master");
            let mut master = Master::new();
            master.load_configuration(configuration.clone());
            RegistryEntry {
                master: Arc::new(Mutex::new(master)),
                poll_thread: None,
                abort: Arc::new(AtomicBool::new(false)),
                reference_count: 0,
                next_id: 0,
                handles_ready: BTreeMap::new(),
                rt_priority,
            }
        });

        entry.reference_count += 1;
        entry.next_id += 1;
        let id = entry.next_id;
        entry.handles_ready.insert(id, false);

        if *lock_master(&entry.master).configuration() != *configuration {
            warn!(
                interface = %interface,
                "master configurations do not match, keeping the existing one"
            );
        }

        debug!(interface = %interface, id, "issued handle");
        Handle {
            id,
            interface,
            master: Arc::clone(&entry.master),
        }
    }

    /// [`acquire`](MasterRegistry::acquire) with [`DEFAULT_RT_PRIORITY`].
    pub fn acquire_default(&self, configuration: &MasterConfiguration) -> Handle<B> {
        self.acquire(configuration, DEFAULT_RT_PRIORITY)
    }

    /// Mark a handle as ready. Once every handle acquired on the interface
    /// is ready the master is started and its polling thread spawned; the
    /// call that completes the barrier returns `Ok(true)`, all others
    /// `Ok(false)`. Activation happens exactly once per master.
    ///
    /// A handle acquired after activation may still be marked ready; the
    /// call is accepted and reports `Ok(false)` without re-running startup.
    pub fn mark_ready(&self, handle: &Handle<B>) -> Result<bool, RegistryError> {
        let mut entries = self.lock_entries();
        let entry = entries
            .get_mut(handle.interface())
            .ok_or_else(|| RegistryError::NotManaged {
                interface: handle.interface().to_string(),
            })?;

        match entry.handles_ready.get_mut(&handle.id) {
            Some(ready) if *ready => {
                return Err(RegistryError::AlreadyReady {
                    id: handle.id,
                    interface: handle.interface().to_string(),
                })
            }
            Some(ready) => *ready = true,
            None => {
                return Err(RegistryError::NotManaged {
                    interface: handle.interface().to_string(),
                })
            }
        }

        if entry.poll_thread.is_some() {
            debug!(
                interface = %handle.interface(),
                id = handle.id,
                "handle marked ready after activation"
            );
            return Ok(false);
        }

        if !entry.handles_ready.values().all(|ready| *ready) {
            info!(
                interface = %handle.interface(),
                "not all handles ready, deferring start"
            );
            return Ok(false);
        }

        if !lock_master(&entry.master).startup()? {
            return Err(RegistryError::Startup {
                interface: handle.interface().to_string(),
            });
        }

        info!(
            interface = %handle.interface(),
            rt_priority = entry.rt_priority,
            "all handles ready, starting polling thread"
        );
        entry.poll_thread = Some(spawn_polling_thread(
            handle.interface(),
            Arc::clone(&entry.master),
            Arc::clone(&entry.abort),
            entry.rt_priority,
        )?);
        Ok(true)
    }

    /// Whether a master for the given interface is currently managed.
    pub fn has_master(&self, interface: &str) -> bool {
        self.lock_entries().contains_key(interface)
    }

    /// [`has_master`](MasterRegistry::has_master), keyed by configuration.
    pub fn has_master_for(&self, configuration: &MasterConfiguration) -> bool {
        self.has_master(&configuration.network_interface)
    }

    /// Outstanding handles on the given interface, if managed.
    pub fn reference_count(&self, interface: &str) -> Option<i32> {
        self.lock_entries()
            .get(interface)
            .map(|entry| entry.reference_count)
    }

    /// Release a handle. The release that drops the reference count to zero
    /// tears the master down (abort the polling thread, join it, drive the
    /// devices to a safe state, close the bus) and returns `Ok(true)`.
    pub fn release(&self, handle: &Handle<B>) -> Result<bool, RegistryError> {
        let mut entries = self.lock_entries();
        let entry = entries
            .get_mut(handle.interface())
            .ok_or_else(|| RegistryError::NotManaged {
                interface: handle.interface().to_string(),
            })?;

        entry.reference_count -= 1;
        // The consumer is no longer expected at the barrier. Activation is
        // still only ever triggered from mark_ready.
        entry.handles_ready.remove(&handle.id);

        if entry.reference_count <= 0 {
            info!(
                interface = %handle.interface(),
                "last handle released, shutting down master"
            );
            let entry = entries
                .remove(handle.interface())
                .expect("entry vanished under the registry lock");
            teardown_entry(handle.interface(), entry);
            return Ok(true);
        }

        debug!(
            interface = %handle.interface(),
            remaining = entry.reference_count,
            "released handle"
        );
        Ok(false)
    }

    /// Tear a master down regardless of its reference count.
    ///
    /// Escape hatch to guarantee the physical bus is left in a safe state
    /// even under a buggy shutdown sequence. Any consumer still holding an
    /// un-released handle will subsequently observe a closed bus; prefer a
    /// controlled fault over an uncontrolled one.
    pub fn force_shutdown(&self, interface: &str) -> Result<(), RegistryError> {
        let mut entries = self.lock_entries();
        let entry = entries
            .remove(interface)
            .ok_or_else(|| RegistryError::NotManaged {
                interface: interface.to_string(),
            })?;

        warn!(
            interface,
            outstanding = entry.reference_count,
            "forced shutdown, outstanding handles will observe a closed bus"
        );
        teardown_entry(interface, entry);
        Ok(())
    }

    /// [`force_shutdown`](MasterRegistry::force_shutdown), keyed by master.
    pub fn force_shutdown_master(&self, master: &SharedMaster<B>) -> Result<(), RegistryError> {
        let interface = lock_master(master)
            .configuration()
            .network_interface
            .clone();
        self.force_shutdown(&interface)
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry<B>>> {
        // Teardown must proceed even if a bookkeeping thread panicked.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: BusDriver> Default for MasterRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BusDriver> Drop for MasterRegistry<B> {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .map(std::mem::take)
            .unwrap_or_else(|poisoned| std::mem::take(poisoned.into_inner()));

        // Signal every polling thread first so multiple buses wind down in
        // parallel, then join and close them one by one.
        for entry in entries.values() {
            entry.abort.store(true, Ordering::Release);
        }
        for (interface, entry) in entries {
            teardown_entry(&interface, entry);
        }
    }
}

/// Teardown protocol shared by release-to-zero, forced shutdown and registry
/// drop: abort flag → join → pre-shutdown → shutdown, in exactly that order.
/// The caller holds the registry lock; the polling thread never takes it, so
/// the join cannot deadlock. The join is unbounded: a driver whose `update`
/// never returns stalls shutdown, which is a documented liveness assumption.
fn teardown_entry<B: BusDriver>(interface: &str, mut entry: RegistryEntry<B>) {
    entry.abort.store(true, Ordering::Release);
    if let Some(poll_thread) = entry.poll_thread.take() {
        if poll_thread.join().is_err() {
            error!(interface, "polling thread panicked before teardown");
        }
    }

    let mut master = lock_master(&entry.master);
    master.pre_shutdown();
    master.shutdown();
    info!(interface, "master shut down");
}

fn spawn_polling_thread<B: BusDriver>(
    interface: &str,
    master: SharedMaster<B>,
    abort: Arc<AtomicBool>,
    rt_priority: i32,
) -> Result<JoinHandle<()>, RegistryError> {
    let thread_name = format!("ecat-poll-{interface}");
    let interface_owned = interface.to_string();
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || poll_loop(&interface_owned, &master, &abort, rt_priority))
        .map_err(|source| RegistryError::Spawn {
            interface: interface.to_string(),
            source,
        })
}

/// Real-time polling loop: set the priority once, activate, then free-run
/// `update` until the abort flag is observed. `update` itself paces to the
/// bus cycle time, so there is no sleeping here.
fn poll_loop<B: BusDriver>(
    interface: &str,
    master: &SharedMaster<B>,
    abort: &AtomicBool,
    rt_priority: i32,
) {
    {
        let mut master = lock_master(master);
        master.set_realtime_priority(rt_priority);
        if master.activate() {
            info!(
                interface,
                bus = master.bus_name().unwrap_or("<none>"),
                "bus activated, polling"
            );
        }
    }

    while !abort.load(Ordering::Acquire) {
        lock_master(master).update(UpdateMode::StandaloneEnforceRate);
    }

    lock_master(master).deactivate();
    debug!(interface, "polling thread exited");
}

fn lock_master<B: BusDriver>(master: &SharedMaster<B>) -> MutexGuard<'_, Master<B>> {
    master.lock().unwrap_or_else(PoisonError::into_inner)
}
