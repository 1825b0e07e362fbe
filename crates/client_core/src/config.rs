use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const ENV_PREFIX: &str = "APP";
const HOME_DIR_NAME: &str = ".secure_inbox";
const DATABASE_FILE: &str = "svs.sqlite";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub home_dir: PathBuf,
    /// Defaults to `<home_dir>/svs.sqlite` when unset.
    pub database_url: Option<String>,
    pub hostname: String,
    pub sync_display_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub max_concurrent_calls: usize,
    pub max_queued_calls: usize,
    /// `None` resubmits corrupted downloads without limit.
    pub checksum_retry_limit: Option<u32>,
    pub checksum_retry_delay_ms: u64,
    pub status_duration_ms: u64,
    pub error_duration_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            home_dir: home.join(HOME_DIR_NAME),
            database_url: None,
            hostname: "http://localhost:8081".into(),
            sync_display_interval_secs: 30,
            sync_interval_secs: 60,
            max_concurrent_calls: 8,
            max_queued_calls: 64,
            checksum_retry_limit: None,
            checksum_retry_delay_ms: 0,
            status_duration_ms: 5_000,
            error_duration_ms: 10_000,
        }
    }
}

impl ClientSettings {
    /// Defaults, then the optional TOML file, then `APP__*` environment
    /// variables (e.g. `APP__SYNC_INTERVAL_SECS=120`).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        load_with_prefix(path, ENV_PREFIX)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home_dir.join("data")
    }

    pub fn sync_flag_path(&self) -> PathBuf {
        self.home_dir.join("sync_flag")
    }

    pub fn database_url(&self) -> String {
        match self.database_url.as_deref() {
            Some(raw) if !raw.trim().is_empty() => normalize_database_url(raw),
            _ => format!(
                "sqlite://{}",
                self.home_dir
                    .join(DATABASE_FILE)
                    .to_string_lossy()
                    .replace('\\', "/")
            ),
        }
    }

    pub fn sync_display_interval(&self) -> Duration {
        Duration::from_secs(self.sync_display_interval_secs.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn checksum_retry_delay(&self) -> Duration {
        Duration::from_millis(self.checksum_retry_delay_ms)
    }

    pub fn status_duration(&self) -> Duration {
        Duration::from_millis(self.status_duration_ms)
    }

    pub fn error_duration(&self) -> Duration {
        Duration::from_millis(self.error_duration_ms)
    }

    /// Creates the home and data directories. Refuses a home directory that
    /// other users can write to.
    pub fn ensure_home_dir(&self) -> anyhow::Result<()> {
        create_private_dir(&self.home_dir)?;
        check_dir_permissions(&self.home_dir)?;
        fs::create_dir_all(self.data_dir()).with_context(|| {
            format!(
                "failed to create data directory '{}'",
                self.data_dir().display()
            )
        })?;
        Ok(())
    }
}

fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> anyhow::Result<ClientSettings> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to assemble client settings")?
        .try_deserialize::<ClientSettings>()
        .context("invalid client settings")
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("failed to create home directory '{}'", path.display()))
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create home directory '{}'", path.display()))
}

#[cfg(unix)]
fn check_dir_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .with_context(|| format!("failed to stat '{}'", path.display()))?
        .permissions()
        .mode();
    if mode & 0o022 != 0 {
        anyhow::bail!(
            "unsafe permissions {:o} on '{}': directory must not be group or world writable",
            mode & 0o777,
            path.display()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_dir_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
