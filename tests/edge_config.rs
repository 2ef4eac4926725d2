use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crowdwatch_edge::error::{failure_kind, EXIT_CONFIG};
use crowdwatch_edge::{exit_code_for, EdgeConfig, FailureKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CROWDWATCH_CONFIG",
        "CROWDWATCH_EDGE_MODE",
        "CROWDWATCH_SOURCE",
        "CROWDWATCH_DEVICE_ID",
        "CROWDWATCH_MODEL",
        "CROWDWATCH_FRAME_SKIP",
        "CROWDWATCH_CORE_BUDGET",
        "CROWDWATCH_SERVER_URL",
        "CROWDWATCH_COMPRESSION",
        "CROWDWATCH_SPOOL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".json",
        r#"{
            "device_id": "plaza-north",
            "source": { "spec": "rtsp://cam-1/stream", "target_fps": 15 },
            "aggregate": { "density_medium_threshold": 8, "density_high_threshold": 20 },
            "uplink": { "server_url": "https://collector.example/receive_data", "max_uplink_retries": 3 }
        }"#,
    );
    std::env::set_var("CROWDWATCH_CONFIG", file.path());
    std::env::set_var("CROWDWATCH_SOURCE", "stub://override");
    std::env::set_var("CROWDWATCH_COMPRESSION", "false");

    let cfg = EdgeConfig::load().expect("load config");

    assert_eq!(cfg.device_id, "plaza-north");
    assert_eq!(cfg.source.spec, "stub://override");
    assert_eq!(cfg.source.target_fps, 15);
    assert_eq!(cfg.aggregate.density_medium_threshold, 8);
    assert_eq!(cfg.aggregate.density_high_threshold, 20);
    assert_eq!(cfg.uplink.server_url, "https://collector.example/receive_data");
    assert_eq!(cfg.uplink.max_uplink_retries, 3);
    assert!(!cfg.uplink.compression_enabled);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
edge_mode = false

[schedule]
cpu_core_budget = 2

[uplink]
flush_grace_ms = 1500
uplink_spool_capacity = 50
"#,
    );
    let cfg = EdgeConfig::load_from(Some(file.path())).expect("load toml");

    assert!(!cfg.edge_mode);
    assert_eq!(cfg.schedule.frame_skip_interval, 1);
    assert_eq!(cfg.schedule.cpu_core_budget, 2);
    assert_eq!(cfg.uplink.flush_grace, Duration::from_millis(1500));
    assert_eq!(cfg.uplink.uplink_spool_capacity, 50);

    clear_env();
}

#[test]
fn edge_mode_env_picks_throttled_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CROWDWATCH_EDGE_MODE", "true");
    let cfg = EdgeConfig::load().expect("load config");
    assert_eq!(cfg.schedule.frame_skip_interval, 5);
    assert_eq!(cfg.schedule.cpu_core_budget, 1);

    std::env::set_var("CROWDWATCH_FRAME_SKIP", "3");
    let cfg = EdgeConfig::load().expect("load config");
    assert_eq!(cfg.schedule.frame_skip_interval, 3);

    clear_env();
}

#[test]
fn invalid_values_are_config_failures() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CROWDWATCH_FRAME_SKIP", "0");
    let err = EdgeConfig::load().unwrap_err();
    assert_eq!(failure_kind(&err), Some(FailureKind::Config));
    assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    clear_env();

    std::env::set_var("CROWDWATCH_SERVER_URL", "ftp://collector/receive");
    let err = EdgeConfig::load().unwrap_err();
    assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    clear_env();

    let file = temp_config(".json", "{ not json");
    let err = EdgeConfig::load_from(Some(file.path())).unwrap_err();
    assert_eq!(exit_code_for(&err), EXIT_CONFIG);

    let err = EdgeConfig::load_from(Some(std::path::Path::new("/nonexistent/crowdwatch.toml")))
        .unwrap_err();
    assert_eq!(exit_code_for(&err), EXIT_CONFIG);

    clear_env();
}

#[test]
fn spool_path_env_overrides_or_disables_disk_spool() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EdgeConfig::load().expect("load config");
    assert_eq!(
        cfg.uplink.spool_path.as_deref(),
        Some(std::path::Path::new("crowdwatch_spool.db"))
    );

    std::env::set_var("CROWDWATCH_SPOOL_PATH", "/data/spool.db");
    let cfg = EdgeConfig::load().expect("load config");
    assert_eq!(
        cfg.uplink.spool_path.as_deref(),
        Some(std::path::Path::new("/data/spool.db"))
    );

    std::env::set_var("CROWDWATCH_SPOOL_PATH", "");
    let cfg = EdgeConfig::load().expect("load config");
    assert_eq!(cfg.uplink.spool_path, None);

    clear_env();
}
