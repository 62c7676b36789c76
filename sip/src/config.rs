use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Tuning knobs for a UA instance. T1/T2/T4 are the RFC 3261 timer bases;
/// everything else is addressed in the layer that reads it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub max_forwards: u8,
    /// Largest message that still goes out over UDP when no transport is
    /// forced; anything bigger is sent congestion-controlled.
    pub udp_mtu_threshold: usize,
    pub no_detect_loops: bool,
    pub listen_ip: String,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub tls_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Host name advertised in Via and Contact; defaults to the bound or
    /// discovered local address.
    pub local_host: Option<String>,
    /// User part for locally minted From and Contact URIs.
    pub user: String,
    /// Preloaded route set prepended to new out-of-dialog requests.
    pub route_set: Vec<String>,
    /// How long the INVITE server transaction waits for the TU before
    /// answering 100 Trying on its own.
    pub trying_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
            max_forwards: 70,
            udp_mtu_threshold: 1300,
            no_detect_loops: false,
            listen_ip: "0.0.0.0".to_string(),
            udp_port: 5060,
            tcp_port: 5060,
            tls_port: 5061,
            tls_cert: None,
            tls_key: None,
            local_host: None,
            user: "quasar".to_string(),
            route_set: Vec::new(),
            trying_delay_ms: 200,
        }
    }
}

impl Config {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }

    pub fn trying_delay(&self) -> Duration {
        Duration::from_millis(self.trying_delay_ms)
    }
}
