//! Demo: several consumers sharing one simulated EtherCAT bus.
//!
//! Each consumer thread holds its own handle on the shared master, marks it
//! ready, runs for a while and releases it. The bus only goes live once the
//! last consumer arrives at the barrier, and is torn down by whichever
//! consumer releases last.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use tracing::{error, info};

use ecat_master::sim::{self, SimBus, SimDevice};
use ecat_master::{device, MasterConfiguration, MasterRegistry};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("ecat-demo")
        .version("0.1.0")
        .about("Simulated multi-consumer EtherCAT master lifecycle demo")
        .arg(
            Arg::with_name("interface")
                .short("i")
                .long("interface")
                .help("Simulated network interface name")
                .takes_value(true)
                .default_value("sim0"),
        )
        .arg(
            Arg::with_name("consumers")
                .short("c")
                .long("consumers")
                .help("Number of consumers sharing the bus")
                .takes_value(true)
                .default_value("2"),
        )
        .arg(
            Arg::with_name("priority")
                .short("p")
                .long("priority")
                .help("Real-time priority for the polling thread")
                .takes_value(true)
                .default_value("48"),
        )
        .arg(
            Arg::with_name("runtime")
                .short("t")
                .long("runtime-ms")
                .help("How long each consumer keeps its handle, in milliseconds")
                .takes_value(true)
                .default_value("2000"),
        )
        .get_matches();

    let interface = matches.value_of("interface").unwrap_or("sim0").to_string();
    let consumers: usize = matches.value_of("consumers").unwrap_or("2").parse()?;
    let priority: i32 = matches.value_of("priority").unwrap_or("48").parse()?;
    let runtime_ms: u64 = matches.value_of("runtime").unwrap_or("2000").parse()?;

    println!("🔌 EtherCAT master lifecycle demo");
    println!("   Interface: {interface}");
    println!("   Consumers: {consumers}");

    let registry = Arc::new(MasterRegistry::<SimBus>::new());
    let config = MasterConfiguration::for_interface(&interface);

    // Acquire every handle up front so the activation barrier really waits
    // for all consumers.
    let mut handles = Vec::new();
    for index in 0..consumers {
        let handle = registry.acquire(&config, priority);

        let mut master = handle
            .master()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        master.create_bus()?;
        master.attach_device(device::shared(SimDevice::with_dc_address(
            &format!("drive-{index}"),
            0x1000 + index as u32,
        )))?;
        drop(master);

        handles.push(handle);
    }

    let mut workers = Vec::new();
    for handle in handles {
        let registry = Arc::clone(&registry);
        workers.push(thread::spawn(move || {
            match registry.mark_ready(&handle) {
                Ok(true) => info!(id = handle.id(), "completed the barrier, bus is live"),
                Ok(false) => info!(id = handle.id(), "ready, waiting for the others"),
                Err(e) => {
                    error!(id = handle.id(), "mark_ready failed: {e}");
                    return;
                }
            }

            thread::sleep(Duration::from_millis(runtime_ms));

            match registry.release(&handle) {
                Ok(true) => info!(id = handle.id(), "released last handle, bus torn down"),
                Ok(false) => info!(id = handle.id(), "released handle"),
                Err(e) => error!(id = handle.id(), "release failed: {e}"),
            }
        }));
    }

    for worker in workers {
        let _ = worker.join();
    }

    let recorder = sim::recorder(&interface);
    println!("📋 Bus event log:");
    println!("{}", serde_json::to_string_pretty(&recorder.events())?);
    println!("   Exchange cycles: {}", recorder.update_count());

    Ok(())
}
