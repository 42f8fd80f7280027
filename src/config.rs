use std::time::Duration;

use crate::cli::Args;

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the UDP echo server binds and probes are sent to
    pub udp_port: u16,
    /// Port the terminal dashboard listens on
    pub dashboard_port: u16,
    /// Interval between probe rounds
    pub probe_interval: Duration,
    /// Interval between mDNS lookup queries
    pub lookup_interval: Duration,
    /// Interval between dashboard redraws
    pub refresh_interval: Duration,
    /// Whether to advertise the _ssh._tcp service
    pub advertise_tcp: bool,
    /// Hostname label override; the OS hostname is used when absent
    pub hostname_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            udp_port: 3382,
            dashboard_port: 3637,
            probe_interval: Duration::from_secs(1),
            lookup_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(1),
            advertise_tcp: false,
            hostname_override: None,
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Config {
            udp_port: args.udp_port,
            dashboard_port: args.dashboard_port,
            probe_interval: args.probe_interval_duration(),
            lookup_interval: args.lookup_interval_duration(),
            refresh_interval: args.refresh_interval_duration(),
            advertise_tcp: args.advertise_tcp,
            hostname_override: args.hostname.clone(),
        }
    }
}
