use serde::{Deserialize, Serialize};

/// Default bus cycle time: 1 kHz exchange rate.
pub const DEFAULT_TIME_STEP_NS: u64 = 1_000_000;

/// Safety margin added to the current bus time when arming distributed-clock
/// sync-0 signals. All DC-capable slaves receive the same future start time,
/// so their cyclic pulses begin in phase well after the registers are written.
pub const DEFAULT_DC_SYNC0_ACTIVATION_DELAY_NS: u64 = 500_000_000;

const DEFAULT_UPDATE_RATE_WARN_THRESHOLD: u32 = 50;
const DEFAULT_SLAVE_DISCOVER_RETRIES: u32 = 10;

/// Configuration of one EtherCAT master.
///
/// `network_interface` doubles as the sharing key in the registry: every
/// consumer acquiring a master with the same interface name ends up on the
/// same master instance. The struct is compared by value when a second
/// consumer acquires an already-running master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfiguration {
    /// Network interface the bus socket is bound to (e.g. `eth0`).
    pub network_interface: String,
    /// Bus exchange cycle time in nanoseconds.
    pub time_step_ns: u64,
    /// Warn when the observed update rate falls below this percentage of the
    /// configured rate.
    pub update_rate_warn_threshold: u32,
    /// Retries for the initial slave discovery scan before giving up.
    pub slave_discover_retries: u32,
    /// Margin between the current bus time and the common DC sync-0 start.
    pub dc_sync0_activation_delay_ns: u64,
}

impl Default for MasterConfiguration {
    fn default() -> Self {
        Self {
            network_interface: String::new(),
            time_step_ns: DEFAULT_TIME_STEP_NS,
            update_rate_warn_threshold: DEFAULT_UPDATE_RATE_WARN_THRESHOLD,
            slave_discover_retries: DEFAULT_SLAVE_DISCOVER_RETRIES,
            dc_sync0_activation_delay_ns: DEFAULT_DC_SYNC0_ACTIVATION_DELAY_NS,
        }
    }
}

impl MasterConfiguration {
    /// Default configuration bound to the given network interface.
    pub fn for_interface(network_interface: &str) -> Self {
        Self {
            network_interface: network_interface.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_interface_uses_defaults() {
        let config = MasterConfiguration::for_interface("eth0");

        assert_eq!(config.network_interface, "eth0");
        assert_eq!(config.time_step_ns, DEFAULT_TIME_STEP_NS);
        assert_eq!(
            config.dc_sync0_activation_delay_ns,
            DEFAULT_DC_SYNC0_ACTIVATION_DELAY_NS
        );
    }

    #[test]
    fn test_value_equality() {
        let a = MasterConfiguration::for_interface("eth0");
        let b = MasterConfiguration::for_interface("eth0");
        assert_eq!(a, b);

        let mut c = MasterConfiguration::for_interface("eth0");
        c.time_step_ns = 2_000_000;
        assert_ne!(a, c);
    }
}
