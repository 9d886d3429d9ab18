use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ini::{Ini, Properties};

use crate::error::{ConfigurationError, Error, Result};

const APPLICATION_DIRECTORY: &str = "svctunnel";
const TUNNEL_NAME: &str = "svctunnel";

/// File locations used by the daemon. The controller treats them as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub settings_dir: PathBuf,
    pub wireguard_binary: PathBuf,
    /// Where the tunnel configuration is materialized. Its file stem is the tunnel name.
    pub wireguard_config: PathBuf,
    pub log_file: PathBuf,
    pub socket: PathBuf,
}

impl Paths {
    pub fn in_directory(settings_dir: impl Into<PathBuf>) -> Self {
        let settings_dir = settings_dir.into();
        Self {
            wireguard_binary: default_wireguard_binary(),
            wireguard_config: settings_dir.join(format!("{TUNNEL_NAME}.conf")),
            log_file: settings_dir.join("logs").join(format!("{APPLICATION_DIRECTORY}.log")),
            socket: default_socket(&settings_dir),
            settings_dir,
        }
    }
}

#[cfg(windows)]
fn default_wireguard_binary() -> PathBuf {
    PathBuf::from(r"C:\Program Files\WireGuard\wireguard.exe")
}

#[cfg(not(windows))]
fn default_wireguard_binary() -> PathBuf {
    PathBuf::from("wg-quick")
}

#[cfg(windows)]
fn default_socket(_settings_dir: &Path) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{APPLICATION_DIRECTORY}"))
}

#[cfg(not(windows))]
fn default_socket(settings_dir: &Path) -> PathBuf {
    settings_dir.join("daemon.sock")
}

/// Deadlines and polling cadence of the tunnel controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// How long to wait for the service to appear after the install command.
    pub install: Duration,
    /// How long to wait for an installed service to report running.
    pub start: Duration,
    pub uninstall: Duration,
    /// First checkpoint after which a still-running service gets a repeated
    /// uninstall command. Doubles after every retry.
    pub uninstall_retry: Duration,
    /// Tick of the connected-state control loop.
    pub poll_interval: Duration,
    /// Tick of the install/start/uninstall waits.
    pub wait_interval: Duration,
    /// First delay before a failed restart is retried. Doubles after every retry.
    pub restart_retry: Duration,
    pub max_restart_attempts: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        // Slow hosts need minutes for the service manager to settle.
        Self {
            install: Duration::from_secs(3 * 60),
            start: Duration::from_secs(5 * 60),
            uninstall: Duration::from_secs(3 * 60),
            uninstall_retry: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
            wait_interval: Duration::from_millis(10),
            restart_retry: Duration::from_secs(3),
            max_restart_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub paths: Paths,
    pub timeouts: Timeouts,
}

impl Settings {
    /// Platform defaults rooted in the user's local data directory.
    pub fn platform_default() -> Result<Self> {
        let data_dir = dirs::data_local_dir().ok_or(ConfigurationError::HomeDirectoryNotAvailable)?;
        Ok(Self {
            paths: Paths::in_directory(data_dir.join(APPLICATION_DIRECTORY)),
            timeouts: Timeouts::default(),
        })
    }

    /// Platform defaults overridden by the `[paths]` and `[timeouts]` sections
    /// of an INI file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let defaults = Self::platform_default()?;
        Self::load_with_defaults(path, defaults)
    }

    pub fn load_with_defaults(path: &Path, defaults: Self) -> Result<Self> {
        let file = Ini::load_from_file(path).map_err(|error| match error {
            ini::Error::Io(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => {
                Error::from(ConfigurationError::FileNotFound {
                    path: path.display().to_string(),
                })
            }
            ini::Error::Io(io_error) => Error::InputOutput(io_error),
            ini::Error::Parse(parse_error) => ConfigurationError::InvalidFile {
                reason: parse_error.to_string(),
            }
            .into(),
        })?;
        Self::from_ini(&file, defaults)
    }

    fn from_ini(file: &Ini, defaults: Self) -> Result<Self> {
        let mut settings = defaults;

        if let Some(section) = file.section(Some("paths")) {
            let paths = &mut settings.paths;
            if let Some(dir) = section.get("settings_dir") {
                *paths = Paths {
                    wireguard_binary: paths.wireguard_binary.clone(),
                    ..Paths::in_directory(dir)
                };
            }
            override_path(section, "wireguard_binary", &mut paths.wireguard_binary);
            override_path(section, "wireguard_config", &mut paths.wireguard_config);
            override_path(section, "log_file", &mut paths.log_file);
            override_path(section, "socket", &mut paths.socket);
        }

        if let Some(section) = file.section(Some("timeouts")) {
            let timeouts = &mut settings.timeouts;
            override_duration(section, "install_secs", Duration::from_secs, &mut timeouts.install)?;
            override_duration(section, "start_secs", Duration::from_secs, &mut timeouts.start)?;
            override_duration(section, "uninstall_secs", Duration::from_secs, &mut timeouts.uninstall)?;
            override_duration(
                section,
                "uninstall_retry_secs",
                Duration::from_secs,
                &mut timeouts.uninstall_retry,
            )?;
            override_duration(
                section,
                "poll_interval_ms",
                Duration::from_millis,
                &mut timeouts.poll_interval,
            )?;
            override_duration(
                section,
                "wait_interval_ms",
                Duration::from_millis,
                &mut timeouts.wait_interval,
            )?;
            override_duration(
                section,
                "restart_retry_secs",
                Duration::from_secs,
                &mut timeouts.restart_retry,
            )?;
            if let Some(value) = section.get("max_restart_attempts") {
                timeouts.max_restart_attempts = parse_value("max_restart_attempts", value)?;
            }
        }

        Ok(settings)
    }
}

fn override_path(section: &Properties, key: &str, target: &mut PathBuf) {
    if let Some(value) = section.get(key) {
        *target = PathBuf::from(value);
    }
}

fn override_duration(
    section: &Properties,
    key: &str,
    unit: fn(u64) -> Duration,
    target: &mut Duration,
) -> Result<()> {
    if let Some(value) = section.get(key) {
        *target = unit(parse_value(key, value)?);
    }
    Ok(())
}

fn parse_value<T>(field: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|error: T::Err| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            reason: error.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Settings {
        Settings {
            paths: Paths::in_directory("/var/lib/svctunnel"),
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn tunnel_config_lives_in_settings_dir() {
        let paths = Paths::in_directory("/var/lib/svctunnel");
        assert_eq!(
            paths.wireguard_config,
            PathBuf::from("/var/lib/svctunnel/svctunnel.conf")
        );
        #[cfg(unix)]
        assert_eq!(paths.socket, PathBuf::from("/var/lib/svctunnel/daemon.sock"));
    }

    #[test]
    fn overrides_from_ini() {
        let file = Ini::load_from_str(
            "[paths]\n\
             settings_dir = /opt/tunnel\n\
             wireguard_binary = /opt/wg/wireguard\n\
             [timeouts]\n\
             install_secs = 10\n\
             poll_interval_ms = 20\n\
             max_restart_attempts = 5\n",
        )
        .unwrap();

        let settings = Settings::from_ini(&file, defaults()).unwrap();

        assert_eq!(settings.paths.settings_dir, PathBuf::from("/opt/tunnel"));
        assert_eq!(
            settings.paths.wireguard_config,
            PathBuf::from("/opt/tunnel/svctunnel.conf")
        );
        assert_eq!(settings.paths.wireguard_binary, PathBuf::from("/opt/wg/wireguard"));
        assert_eq!(settings.timeouts.install, Duration::from_secs(10));
        assert_eq!(settings.timeouts.poll_interval, Duration::from_millis(20));
        assert_eq!(settings.timeouts.max_restart_attempts, 5);
        assert_eq!(settings.timeouts.start, Timeouts::default().start);
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        let file = Ini::load_from_str("[timeouts]\nstart_secs = soon\n").unwrap();

        let error = Settings::from_ini(&file, defaults()).unwrap_err();

        assert!(matches!(
            error,
            Error::Configuration(ConfigurationError::InvalidValue { ref field, .. }) if field == "start_secs"
        ));
    }

    #[test]
    fn missing_file_is_reported_by_path() {
        let error =
            Settings::load_with_defaults(Path::new("/nonexistent/svctunnel.ini"), defaults())
                .unwrap_err();
        assert!(matches!(
            error,
            Error::Configuration(ConfigurationError::FileNotFound { .. })
        ));
    }
}
