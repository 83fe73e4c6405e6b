use calcvm_core::{ConfigError, Fixed8, ManualClock, Vm, VmConfig};
use std::io::Write;
use std::sync::Arc;

#[test]
fn loads_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{ "memory_size": 2048, "stack_depth": 8, "pid_count": 2, "step_pause_us": 250 }}"#
    )
    .unwrap();

    let config = VmConfig::load(file.path()).unwrap();
    assert_eq!(config.memory_size, 2048);
    assert_eq!(config.map_size, 16);
    assert_eq!(config.step_pause().as_micros(), 250);

    let vm: Vm<Fixed8> = config
        .build_with_clock(Arc::new(ManualClock::new(0)))
        .unwrap();
    assert_eq!(vm.memory().capacity(), 2048);
    assert_eq!(vm.stack().capacity(), 8);
    assert_eq!(vm.pids().len(), 2);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = VmConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn config_round_trips_through_json() {
    let config = VmConfig {
        debug: true,
        pid_interval_ms: 25,
        ..VmConfig::default()
    };
    let text = serde_json::to_string(&config).unwrap();
    assert_eq!(VmConfig::from_json(&text).unwrap(), config);
}
