use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::LevelFilter, fmt, layer::SubscriberExt, reload,
    util::SubscriberInitExt,
};

use crate::error::{Result, SystemError};

static FILE_FILTER: OnceCell<FileFilter> = OnceCell::new();

/// Installs the global subscriber: stdout plus the log file, filtered by
/// `RUST_LOG` (default `info`). The previous log file is kept as `<log>.0`.
///
/// The returned guard flushes the file writer when dropped, so it must be
/// held for the lifetime of the process.
pub fn init(log_file: &Path, file_enabled: bool) -> Result<WorkerGuard> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    rotate(log_file)?;

    let (file_output, file_filter, guard) = file_layer(log_file, file_enabled)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(file_output)
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|error| SystemError::LoggingInit(error.to_string()))?;

    FILE_FILTER
        .set(file_filter)
        .map_err(|_| SystemError::LoggingInit("logging already initialized".to_string()))?;
    Ok(guard)
}

/// Stdout only, for short-lived commands.
pub fn init_console() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Turns writing to the log file on or off at runtime.
pub fn set_file_logging(enabled: bool) -> Result<()> {
    let file_filter = FILE_FILTER.get().ok_or(SystemError::LoggingNotInitialized)?;
    if enabled {
        file_filter.set_enabled(true)?;
        info!("File logging enabled");
    } else {
        info!("File logging disabled");
        file_filter.set_enabled(false)?;
    }
    Ok(())
}

/// Switches the file layer between passing everything through and dropping
/// everything. Level selection stays with the global `EnvFilter`.
#[derive(Debug, Clone)]
struct FileFilter(reload::Handle<LevelFilter, Registry>);

impl FileFilter {
    fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.0
            .reload(file_level(enabled))
            .map_err(|error| SystemError::LoggingReload(error.to_string()).into())
    }
}

fn file_level(enabled: bool) -> LevelFilter {
    if enabled { LevelFilter::TRACE } else { LevelFilter::OFF }
}

/// Plain-text layer appending to `log_file` from a background writer thread.
/// Must be the first layer on the registry.
fn file_layer(
    log_file: &Path,
    enabled: bool,
) -> Result<(impl Layer<Registry>, FileFilter, WorkerGuard)> {
    let directory = log_file.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_file.file_name().ok_or_else(|| {
        SystemError::LoggingInit(format!("invalid log file path: {}", log_file.display()))
    })?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let (filter, handle) = reload::Layer::new(file_level(enabled));
    let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter);
    Ok((layer, FileFilter(handle), guard))
}

pub fn rotated_path(log_file: &Path) -> PathBuf {
    let mut name = OsString::from(log_file.as_os_str());
    name.push(".0");
    PathBuf::from(name)
}

/// Moves the current log file over the rotated one.
pub fn rotate(log_file: &Path) -> Result<()> {
    match std::fs::rename(log_file, rotated_path(log_file)) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// The last `max_bytes` of the rotated and current log files, oldest first.
pub async fn read_log_tail(log_file: &Path, max_bytes: u64) -> Result<String> {
    let mut contents = Vec::new();
    for path in [rotated_path(log_file), log_file.to_path_buf()] {
        match tokio::fs::read(&path).await {
            Ok(bytes) => contents.extend_from_slice(&bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
    }

    let max_bytes = usize::try_from(max_bytes).unwrap_or(usize::MAX);
    let start = contents.len().saturating_sub(max_bytes);
    Ok(String::from_utf8_lossy(&contents[start..]).into_owned())
}
