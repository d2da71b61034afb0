use std::time::Duration;

use tempfile::tempdir;
use zbgateway::config::Config;

#[tokio::test]
async fn create_default_then_load_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();

    tokio_test::assert_ok!(Config::create_default(path).await);
    let config = tokio_test::assert_ok!(Config::load(path).await);
    assert_eq!(config, Config::default());
    assert_eq!(config.gateway.reply_timeout(), Duration::from_secs(1));
    assert_eq!(config.uplink.metric_queue_capacity, 100);
}

#[tokio::test]
async fn load_accepts_partial_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.toml");
    std::fs::write(&path, "[gateway]\nmax_attempts = 5\nknown_devices = [\"D1\"]\n").unwrap();

    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    assert_eq!(config.gateway.max_attempts, 5);
    assert_eq!(config.gateway.known_devices, vec!["D1".to_string()]);
    assert_eq!(config.serial.port, "/dev/ttyUSB0");
    assert_eq!(config.logging.level, "info");
}

#[tokio::test]
async fn load_rejects_invalid_values_and_missing_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[gateway]\nreply_timeout_ms = 0\n").unwrap();
    let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("reply_timeout_ms"));

    let missing = dir.path().join("nope.toml");
    assert!(Config::load(missing.to_str().unwrap()).await.is_err());
}
