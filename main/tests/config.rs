//! End-to-end checks of the engine's outer surface: configuration loading,
//! CLI overrides, and exit codes.

use std::ffi::OsString;
use std::io::Write;

fn args(argv: &[&str]) -> Vec<OsString> {
    argv.iter().map(OsString::from).collect()
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const EMPTY_SIM_CONFIG: &str = r#"
general:
  stop_time: 1
network:
  graph:
    nodes:
      - id: 0
    edges:
      - source: 0
        target: 0
        latency_ns: 1000000
hosts:
  lonely:
    network_node_id: 0
"#;

#[test]
fn test_missing_config_is_a_config_error() {
    let code = umbra::core::main::run_umbra(args(&["umbra", "/nonexistent-config.yaml"]));
    assert_eq!(code, 1);
}

#[test]
fn test_bad_yaml_is_a_config_error() {
    let file = write_config("general: [this is not\n  a valid config");
    let path = file.path().to_str().unwrap();

    let code = umbra::core::main::run_umbra(args(&["umbra", path]));
    assert_eq!(code, 1);
}

#[test]
fn test_unknown_graph_node_is_a_config_error() {
    let file = write_config(
        "general:\n  stop_time: 1\nnetwork:\n  graph:\n    nodes: []\n    edges: []\nhosts:\n  h:\n    network_node_id: 99\n",
    );
    let path = file.path().to_str().unwrap();

    let code = umbra::core::main::run_umbra(args(&["umbra", path]));
    assert_eq!(code, 1);
}

#[test]
fn test_show_config_exits_cleanly() {
    let file = write_config(EMPTY_SIM_CONFIG);
    let path = file.path().to_str().unwrap();

    let code = umbra::core::main::run_umbra(args(&["umbra", path, "--show-config"]));
    assert_eq!(code, 0);
}

#[test]
fn test_empty_simulation_completes() {
    let file = write_config(EMPTY_SIM_CONFIG);
    let path = file.path().to_str().unwrap();

    // a host with no applications schedules no events; the simulation ends
    // immediately and successfully
    let code = umbra::core::main::run_umbra(args(&[
        "umbra",
        path,
        "--seed",
        "5",
        "--workers",
        "2",
        "--end-time",
        "2",
        "--log-level",
        "error",
    ]));
    assert_eq!(code, 0);
}
