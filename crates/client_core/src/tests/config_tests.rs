use super::*;
use std::env;

#[test]
fn defaults_match_documented_intervals() {
    let settings = ClientSettings::default();
    assert_eq!(settings.sync_display_interval(), Duration::from_secs(30));
    assert_eq!(settings.sync_interval(), Duration::from_secs(60));
    assert_eq!(settings.checksum_retry_limit, None);
    assert_eq!(settings.checksum_retry_delay(), Duration::ZERO);
    assert!(settings.home_dir.ends_with(HOME_DIR_NAME));
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("client.toml");
    fs::write(
        &path,
        r#"
home_dir = "/tmp/inbox-home"
sync_interval_secs = 120
checksum_retry_limit = 3
"#,
    )
    .expect("write config");

    let settings = load_with_prefix(Some(&path), "CFGTEST_FILE").expect("settings");
    assert_eq!(settings.home_dir, PathBuf::from("/tmp/inbox-home"));
    assert_eq!(settings.sync_interval_secs, 120);
    assert_eq!(settings.checksum_retry_limit, Some(3));
    assert_eq!(settings.max_concurrent_calls, 8);
    assert_eq!(
        settings.sync_flag_path(),
        PathBuf::from("/tmp/inbox-home/sync_flag")
    );
}

#[test]
fn environment_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("client.toml");
    fs::write(&path, "sync_interval_secs = 120\n").expect("write config");
    env::set_var("CFGTEST_ENV__SYNC_INTERVAL_SECS", "15");
    env::set_var("CFGTEST_ENV__HOSTNAME", "http://proxy.internal");

    let settings = load_with_prefix(Some(&path), "CFGTEST_ENV").expect("settings");

    env::remove_var("CFGTEST_ENV__SYNC_INTERVAL_SECS");
    env::remove_var("CFGTEST_ENV__HOSTNAME");
    assert_eq!(settings.sync_interval_secs, 15);
    assert_eq!(settings.hostname, "http://proxy.internal");
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = load_with_prefix(Some(&dir.path().join("absent.toml")), "CFGTEST_MISSING");
    assert!(result.is_err());
}

#[test]
fn database_url_defaults_into_home_dir() {
    let settings = ClientSettings {
        home_dir: PathBuf::from("/srv/inbox"),
        ..ClientSettings::default()
    };
    assert_eq!(settings.database_url(), "sqlite:///srv/inbox/svs.sqlite");

    let settings = ClientSettings {
        database_url: Some("./data/client.db".into()),
        ..ClientSettings::default()
    };
    assert_eq!(settings.database_url(), "sqlite://./data/client.db");

    let settings = ClientSettings {
        database_url: Some("sqlite::memory:".into()),
        ..ClientSettings::default()
    };
    assert_eq!(settings.database_url(), "sqlite::memory:");
}

#[cfg(unix)]
#[test]
fn ensure_home_dir_creates_private_directories() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().expect("tempdir");
    let settings = ClientSettings {
        home_dir: root.path().join("home"),
        ..ClientSettings::default()
    };
    settings.ensure_home_dir().expect("home dir");

    assert!(settings.data_dir().is_dir());
    let mode = fs::metadata(&settings.home_dir)
        .expect("stat")
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0);
}

#[cfg(unix)]
#[test]
fn ensure_home_dir_rejects_world_writable_home() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().expect("tempdir");
    let home = root.path().join("home");
    fs::create_dir(&home).expect("mkdir");
    fs::set_permissions(&home, fs::Permissions::from_mode(0o777)).expect("chmod");

    let settings = ClientSettings {
        home_dir: home,
        ..ClientSettings::default()
    };
    let err = settings.ensure_home_dir().expect_err("unsafe home");
    assert!(err.to_string().contains("world writable"));
}
