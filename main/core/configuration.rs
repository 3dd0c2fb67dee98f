//! The simulation configuration document and the command line that overrides
//! parts of it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "umbra",
    version,
    about = "Umbra runs real applications on simulated hosts under a virtual clock \
             and a modeled network, deterministically.",
    after_help = "If units are not specified, all times are in simulated seconds."
)]
pub struct CliOptions {
    /// Path to the simulation configuration file, or '-' to read from stdin
    pub config: Option<String>,

    /// Seed for the simulation's pseudorandom number generator
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Number of worker threads (0 uses one thread per CPU)
    #[arg(long, value_name = "K")]
    pub workers: Option<u32>,

    /// Log level of the engine's output
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Simulated time at which the simulation ends, in seconds
    #[arg(long, value_name = "T")]
    pub end_time: Option<u64>,

    /// Remove shared-memory files leaked by previous runs, then exit
    #[arg(long)]
    pub shm_cleanup: bool,

    /// Print the final assembled configuration, then exit
    #[arg(long)]
    pub show_config: bool,
}

// ValueEnum's default kebab-case names already match the lowercase serde ones
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_seed() -> u64 {
    1
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// The assembled simulation configuration: the parsed configuration file with
/// any command-line overrides applied.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOptions {
    pub general: GeneralOptions,
    pub network: NetworkOptions,
    /// Hosts by name. A BTreeMap so that host creation order (and therefore
    /// host ids and derived seeds) is independent of the document order.
    pub hosts: BTreeMap<String, HostOptions>,
}

impl ConfigOptions {
    pub fn apply_cli_overrides(&mut self, cli: &CliOptions) {
        if let Some(seed) = cli.seed {
            self.general.seed = seed;
        }
        if let Some(workers) = cli.workers {
            self.general.parallelism = workers;
        }
        if let Some(log_level) = cli.log_level {
            self.general.log_level = log_level;
        }
        if let Some(end_time) = cli.end_time {
            self.general.stop_time = end_time;
        }
    }

    pub fn stop_time(&self) -> EmulatedTime {
        EmulatedTime::SIMULATION_START + SimulationTime::from_secs(self.general.stop_time)
    }

    pub fn bootstrap_end_time(&self) -> EmulatedTime {
        EmulatedTime::SIMULATION_START
            + SimulationTime::from_secs(self.general.bootstrap_end_time)
    }

    /// The number of workers to run, resolving 0 to the CPU count.
    pub fn parallelism(&self) -> usize {
        match self.general.parallelism {
            0 => std::thread::available_parallelism()
                .map(|x| x.get())
                .unwrap_or(1),
            n => n as usize,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Simulated seconds after which the simulation ends.
    pub stop_time: u64,

    /// Initial state of every random source in the simulation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of worker threads; 0 uses one per CPU.
    #[serde(default)]
    pub parallelism: u32,

    /// Simulated seconds during which packet loss is disabled, so that
    /// applications can bootstrap over a reliable network.
    #[serde(default)]
    pub bootstrap_end_time: u64,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// When enabled, the round window tracks the smallest packet latency the
    /// simulation has actually used rather than the smallest possible one.
    #[serde(default)]
    pub use_dynamic_runahead: bool,

    /// A lower bound for the round window, in milliseconds.
    #[serde(default)]
    pub runahead: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkOptions {
    pub graph: GraphOptions,
}

/// The topology graph. Hosts attach to nodes; edges carry the latency, loss,
/// and jitter of the path between their endpoints. An edge from a node to
/// itself describes the path between two hosts attached to that node.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphOptions {
    pub nodes: Vec<NodeOptions>,
    pub edges: Vec<EdgeOptions>,
    /// When false, each configured edge is also traversable in reverse.
    #[serde(default)]
    pub directed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeOptions {
    pub id: u32,
    /// Host downstream bandwidth in bits per second, if limited.
    #[serde(default)]
    pub host_bandwidth_down: Option<u64>,
    /// Host upstream bandwidth in bits per second, if limited.
    #[serde(default)]
    pub host_bandwidth_up: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeOptions {
    pub source: u32,
    pub target: u32,
    /// One-way latency in nanoseconds. Must not be 0: it bounds the round
    /// window from below.
    pub latency_ns: u64,
    /// Latency variation in nanoseconds.
    #[serde(default)]
    pub jitter_ns: u64,
    /// Probability in [0, 1] that a packet on this edge is lost.
    #[serde(default)]
    pub packet_loss: f32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostOptions {
    /// The graph node this host attaches to.
    pub network_node_id: u32,
    /// A fixed address, or None to assign one automatically.
    #[serde(default)]
    pub ip_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub processes: Vec<ProcessOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessOptions {
    /// Path of the application binary to execute.
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Simulated seconds after the simulation start at which to launch.
    #[serde(default)]
    pub start_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r#"
general:
  stop_time: 10
  seed: 42
network:
  graph:
    nodes:
      - id: 0
    edges:
      - source: 0
        target: 0
        latency_ns: 10000000
hosts:
  server:
    network_node_id: 0
    processes:
      - path: /bin/server
        args: ["--port", "80"]
  client:
    network_node_id: 0
    ip_addr: 11.0.0.1
    processes:
      - path: /bin/client
        start_time: 1
"#;

    #[test]
    fn test_parse_example() {
        let config: ConfigOptions = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.general.stop_time, 10);
        assert_eq!(config.general.seed, 42);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.network.graph.edges[0].latency_ns, 10_000_000);

        // host iteration order is by name, not document order
        let names: Vec<&String> = config.hosts.keys().collect();
        assert_eq!(names, vec!["client", "server"]);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config: ConfigOptions = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        let cli =
            CliOptions::parse_from(["umbra", "config.yaml", "--seed", "7", "--end-time", "30"]);
        config.apply_cli_overrides(&cli);
        assert_eq!(config.general.seed, 7);
        assert_eq!(config.general.stop_time, 30);
        // untouched fields keep their file values
        assert_eq!(config.general.log_level, LogLevel::Info);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = "general:\n  stop_time: 10\n  frobnicate: yes\nnetwork:\n  graph:\n    nodes: []\n    edges: []\nhosts: {}\n";
        assert!(serde_yaml::from_str::<ConfigOptions>(bad).is_err());
    }
}
