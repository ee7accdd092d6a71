use std::path::PathBuf;
use std::time::Duration;

/// Socket path used when none is configured.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/86extsock";

/// One host clock unit in the host timer's 32.32 fixed-point format.
pub const DEFAULT_TICK_PERIOD: u64 = 1 << 32;

/// Configuration for one bridged device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Endpoint of the external device process.
    pub socket_path: PathBuf,
    /// Bounded receive used by the transport reader between shutdown checks.
    pub poll_interval: Duration,
    /// Interval of the asynchronous dispatch tick, in host timer units.
    pub tick_period: u64,
    /// Handshake settings.
    pub registration: RegistrationConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            poll_interval: Duration::from_secs(1),
            tick_period: DEFAULT_TICK_PERIOD,
            registration: RegistrationConfig::default(),
        }
    }
}

/// Configuration for the region registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationConfig {
    /// Deadline for the whole handshake. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Maximum number of regions one device may announce.
    pub max_regions: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(5)),
            max_regions: 16,
        }
    }
}
