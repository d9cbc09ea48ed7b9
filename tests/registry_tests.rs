use std::sync::Arc;
use std::time::Duration;

use ecat_master::sim::{self, BusEvent, SimBus, SimDevice};
use ecat_master::{device, MasterConfiguration, MasterError, MasterRegistry, RegistryError};

/// Acquisitions get unique interfaces so the process-wide sim recorders do
/// not bleed between tests.
fn registry() -> MasterRegistry<SimBus> {
    MasterRegistry::new()
}

fn prepare_master(
    registry: &MasterRegistry<SimBus>,
    config: &MasterConfiguration,
    device_name: &str,
) -> ecat_master::Handle<SimBus> {
    let handle = registry.acquire_default(config);
    let mut master = handle
        .master()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    master.create_bus().unwrap();
    master
        .attach_device(device::shared(SimDevice::new(device_name)))
        .unwrap();
    drop(master);
    handle
}

#[test]
fn test_same_interface_resolves_to_same_master() {
    let registry = registry();
    let config = MasterConfiguration::for_interface("it-same-master");

    let a = registry.acquire_default(&config);
    let b = registry.acquire_default(&config);
    let c = registry.acquire_default(&config);

    assert!(Arc::ptr_eq(a.master(), b.master()));
    assert!(Arc::ptr_eq(a.master(), c.master()));
    assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));
    assert_eq!(registry.reference_count("it-same-master"), Some(3));

    for handle in [a, b, c] {
        registry.release(&handle).unwrap();
    }
    assert!(!registry.has_master("it-same-master"));
}

#[test]
fn test_release_without_ready_never_starts_anything() {
    let registry = registry();
    let config = MasterConfiguration::for_interface("it-no-ready");

    let handle = registry.acquire_default(&config);
    assert!(registry.release(&handle).unwrap());

    let recorder = sim::recorder("it-no-ready");
    assert_eq!(recorder.count_of(&BusEvent::Startup), 0);
    assert_eq!(recorder.count_of(&BusEvent::Activated), 0);
    assert_eq!(recorder.update_count(), 0);
}

#[test]
fn test_barrier_gates_activation_across_two_consumers() {
    let interface = "it-barrier";
    let registry = registry();
    let config = MasterConfiguration::for_interface(interface);

    let a = prepare_master(&registry, &config, "drive-a");
    let b = registry.acquire_default(&config);
    assert_eq!(registry.reference_count(interface), Some(2));

    // First arrival defers, nothing starts.
    assert!(!registry.mark_ready(&a).unwrap());
    let recorder = sim::recorder(interface);
    assert_eq!(recorder.count_of(&BusEvent::Startup), 0);

    // Second arrival completes the barrier and activates the bus.
    assert!(registry.mark_ready(&b).unwrap());
    assert_eq!(recorder.count_of(&BusEvent::Startup), 1);

    // The polling thread is live and exchanging cycles.
    std::thread::sleep(Duration::from_millis(50));
    assert!(recorder.update_count() > 0);

    assert!(!registry.release(&a).unwrap());
    assert!(registry.has_master(interface));
    assert!(registry.release(&b).unwrap());
    assert!(!registry.has_master(interface));

    assert_eq!(recorder.count_of(&BusEvent::Startup), 1);
    assert_eq!(recorder.count_of(&BusEvent::Closed), 1);
}

#[test]
fn test_mark_ready_twice_fails_with_already_ready() {
    let registry = registry();
    let config = MasterConfiguration::for_interface("it-double-ready");

    let handle = prepare_master(&registry, &config, "drive");
    assert!(registry.mark_ready(&handle).unwrap());

    let second = registry.mark_ready(&handle);
    assert!(matches!(
        second,
        Err(RegistryError::AlreadyReady { id: 1, .. })
    ));

    registry.release(&handle).unwrap();
}

#[test]
fn test_release_after_teardown_fails_with_not_managed() {
    let registry = registry();
    let config = MasterConfiguration::for_interface("it-stale-release");

    let handle = registry.acquire_default(&config);
    assert!(registry.release(&handle).unwrap());

    let stale = registry.release(&handle);
    assert!(matches!(stale, Err(RegistryError::NotManaged { .. })));

    let stale_ready = registry.mark_ready(&handle);
    assert!(matches!(stale_ready, Err(RegistryError::NotManaged { .. })));
}

#[test]
fn test_config_mismatch_warns_and_keeps_existing_master() {
    let registry = registry();
    let mut config_x = MasterConfiguration::for_interface("it-mismatch");
    config_x.time_step_ns = 1_000_000;
    let mut config_y = config_x.clone();
    config_y.time_step_ns = 4_000_000;

    let a = registry.acquire_default(&config_x);
    // Mismatch is a warning only: the acquisition still succeeds and binds
    // to the master configured first.
    let b = registry.acquire_default(&config_y);

    assert!(Arc::ptr_eq(a.master(), b.master()));
    let master = a.master().lock().unwrap();
    assert_eq!(*master.configuration(), config_x);
    drop(master);

    registry.release(&a).unwrap();
    registry.release(&b).unwrap();
}

#[test]
fn test_startup_refusal_surfaces_to_the_barrier_completer() {
    let interface = "it-startup-fail";
    let registry = registry();
    let config = MasterConfiguration::for_interface(interface);

    let handle = prepare_master(&registry, &config, "drive");
    sim::recorder(interface).fail_next_startup();

    let result = registry.mark_ready(&handle);
    assert!(matches!(result, Err(RegistryError::Startup { .. })));

    // No polling thread was started; the master can still be torn down.
    assert_eq!(sim::recorder(interface).update_count(), 0);
    assert!(registry.release(&handle).unwrap());
}

#[test]
fn test_mark_ready_without_bus_propagates_master_error() {
    let registry = registry();
    let config = MasterConfiguration::for_interface("it-no-bus");

    let handle = registry.acquire_default(&config);
    let result = registry.mark_ready(&handle);
    assert!(matches!(
        result,
        Err(RegistryError::Master(MasterError::BusNotCreated))
    ));

    registry.release(&handle).unwrap();
}

#[test]
fn test_reacquire_after_release_never_reissues_a_live_id() {
    let interface = "it-id-reuse";
    let registry = registry();
    let config = MasterConfiguration::for_interface(interface);

    let a = prepare_master(&registry, &config, "drive");
    let b = registry.acquire_default(&config);

    // One consumer bails out before the barrier, another takes its place.
    assert!(!registry.release(&a).unwrap());
    let c = registry.acquire_default(&config);

    // The newcomer must not inherit an outstanding handle's id.
    assert_ne!(c.id(), b.id());
    assert_eq!((b.id(), c.id()), (2, 3));

    // The barrier still waits for the newcomer.
    assert!(!registry.mark_ready(&b).unwrap());
    assert_eq!(sim::recorder(interface).count_of(&BusEvent::Startup), 0);

    // And the newcomer's arrival must not reset b's already-ready guard.
    let again = registry.mark_ready(&b);
    assert!(matches!(again, Err(RegistryError::AlreadyReady { id: 2, .. })));

    assert!(registry.mark_ready(&c).unwrap());
    assert_eq!(sim::recorder(interface).count_of(&BusEvent::Startup), 1);

    assert!(!registry.release(&b).unwrap());
    assert!(registry.release(&c).unwrap());
}

#[test]
fn test_late_handle_shares_the_running_master() {
    let interface = "it-late-handle";
    let registry = registry();
    let config = MasterConfiguration::for_interface(interface);

    let early = prepare_master(&registry, &config, "drive");
    assert!(registry.mark_ready(&early).unwrap());

    // A handle acquired after activation simply shares the running master;
    // its readiness does not re-run the barrier.
    let late = registry.acquire_default(&config);
    assert!(Arc::ptr_eq(early.master(), late.master()));
    assert!(!registry.mark_ready(&late).unwrap());
    assert_eq!(sim::recorder(interface).count_of(&BusEvent::Startup), 1);

    assert!(!registry.release(&early).unwrap());
    assert!(registry.release(&late).unwrap());
    assert_eq!(sim::recorder(interface).count_of(&BusEvent::Closed), 1);
}
