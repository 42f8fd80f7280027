use clap::Parser;
use std::time::Duration;

/// Peer-to-peer LAN latency monitor: discovers peers over mDNS, measures
/// round-trip latency over UDP, ICMP and TCP, and serves a live dashboard
/// to telnet clients.
#[derive(Parser, Debug, Clone)]
#[command(name = "lagmon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// UDP latency probe port
    #[arg(short = 'u', value_name = "PORT", default_value_t = 3382)]
    pub udp_port: u16,

    /// Terminal dashboard port
    #[arg(short = 'U', value_name = "PORT", default_value_t = 3637)]
    pub dashboard_port: u16,

    /// Seconds between latency measurement rounds
    #[arg(short = 't', value_name = "SECONDS", default_value_t = 1)]
    pub probe_interval: u64,

    /// Seconds between mDNS lookups
    #[arg(short = 'T', value_name = "SECONDS", default_value_t = 10)]
    pub lookup_interval: u64,

    /// Seconds between dashboard refreshes (decimal)
    #[arg(short = 'v', value_name = "SECONDS", default_value_t = 1.0)]
    pub refresh_interval: f64,

    /// Advertise the _ssh._tcp service
    #[arg(short = 's')]
    pub advertise_tcp: bool,

    /// Hostname label to advertise (defaults to the OS hostname)
    #[arg(long, value_name = "NAME")]
    pub hostname: Option<String>,
}

impl Args {
    pub fn probe_interval_duration(&self) -> Duration {
        Duration::from_secs(self.probe_interval)
    }

    pub fn lookup_interval_duration(&self) -> Duration {
        Duration::from_secs(self.lookup_interval)
    }

    pub fn refresh_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_interval)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.probe_interval == 0 {
            return Err("Measurement interval must be positive".into());
        }
        if self.lookup_interval == 0 {
            return Err("Lookup interval must be positive".into());
        }
        if self.refresh_interval <= 0.0 {
            return Err("Refresh interval must be positive".into());
        }
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() || hostname.contains('.') {
                return Err("Hostname must be a single non-empty DNS label".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let args = Args::parse_from(["lagmon"]);
        assert_eq!(args.udp_port, 3382);
        assert_eq!(args.dashboard_port, 3637);
        assert_eq!(args.probe_interval, 1);
        assert_eq!(args.lookup_interval, 10);
        assert_eq!(args.refresh_interval, 1.0);
        assert!(!args.advertise_tcp);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn fractional_refresh_interval_parses() {
        let args = Args::parse_from(["lagmon", "-v", "0.25"]);
        assert_eq!(args.refresh_interval_duration(), Duration::from_millis(250));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(Args::parse_from(["lagmon", "-t", "0"]).validate().is_err());
        assert!(Args::parse_from(["lagmon", "-v", "0"]).validate().is_err());
    }

    #[test]
    fn dotted_hostname_is_rejected() {
        let args = Args::parse_from(["lagmon", "--hostname", "a.b"]);
        assert!(args.validate().is_err());
    }
}
