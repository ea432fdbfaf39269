//! Terminal and file logging for applications hosting controllers.
//!
//! Controllers log lifecycle events at `info`, reconfiguration at `debug`
//! and every compute cycle at `trace`. The level filter can be changed on a
//! running process with [`LogHandle::set_filter`], e.g. to watch the loop
//! while tuning it.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::SystemTime,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layered, SubscriberExt},
    reload,
    util::SubscriberInitExt,
};

use crate::PidError;

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

/// Subscriber stack below the level filter
type WithFile = Layered<reload::Layer<FileLayer, Registry>, Registry>;

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

/// Where and how much to log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Directory for log files. Created if missing.
    pub dir: PathBuf,
    /// Log file name, without the `.log` extension.
    /// Defaults to `pidloop_` and the UTC start time, so runs do not share a file.
    pub name: String,
    /// Filter directives, used when `RUST_LOG` is not set.
    pub filter: String,
    /// Also log to stdout.
    pub terminal: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            name: default_log_name(SystemTime::now()),
            filter: "info".to_owned(),
            terminal: true,
        }
    }
}

/// Control over the process-wide logger.
///
/// Holds the writer threads, which flush when the process exits.
pub struct LogHandle {
    /// Current log file and the guard of its writer thread
    file: Mutex<(PathBuf, WorkerGuard)>,
    _terminal: Mutex<Option<WorkerGuard>>,

    file_reload: reload::Handle<FileLayer, Registry>,
    filter_reload: reload::Handle<EnvFilter, WithFile>,
}

impl LogHandle {
    /// Path of the file currently being written.
    pub fn log_path(&self) -> PathBuf {
        match self.file.lock() {
            Ok(file) => file.0.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }

    /// Close the current log file and continue in `{dir}/{name}.log`.
    pub fn retarget(&self, dir: &Path, name: &str) -> Result<PathBuf, PidError> {
        let (path, logfile) = open_log_file(dir, name)?;
        let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

        let mut current = self.file.lock().map_err(|_| PidError::Io {
            msg: "Log file lock poisoned".to_owned(),
        })?;
        self.file_reload
            .modify(|layer| *layer = build_file_layer(file_writer))
            .map_err(|e| PidError::Io {
                msg: format!("Failed to switch log file: {e}"),
            })?;

        // Dropping the old guard flushes the previous file
        *current = (path.clone(), file_guard);
        Ok(path)
    }

    /// Replace the level filter, e.g. `"pidloop=trace"`.
    pub fn set_filter(&self, directives: &str) -> Result<(), PidError> {
        let filter = parse_filter(directives)?;
        self.filter_reload
            .reload(filter)
            .map_err(|e| PidError::config(format!("Failed to change log filter: {e}")))
    }
}

/// `pidloop_` followed by an RFC 3339 timestamp with the colons removed,
/// which some filesystems do not allow.
fn default_log_name(now: SystemTime) -> String {
    let timestamp = DateTime::<Utc>::from(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "");
    format!("pidloop_{timestamp}")
}

fn parse_filter(directives: &str) -> Result<EnvFilter, PidError> {
    EnvFilter::try_new(directives)
        .map_err(|e| PidError::config(format!("Invalid log filter `{directives}`: {e}")))
}

fn open_log_file(dir: &Path, name: &str) -> Result<(PathBuf, File), PidError> {
    fs::create_dir_all(dir).map_err(|e| PidError::Io {
        msg: format!("Failed to create log directory {dir:?}: {e}"),
    })?;
    let path = dir.join(format!("{name}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PidError::Io {
            msg: format!("Failed to open log file {path:?}: {e}"),
        })?;
    Ok((path, file))
}

fn build_file_layer(writer: NonBlocking) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Install the process-wide logger.
///
/// If logging is already set up, only the file is switched to the one named
/// in `settings`; the filter and terminal output stay as they were.
pub fn init_logging(settings: &LogSettings) -> Result<&'static LogHandle, PidError> {
    if let Some(handle) = LOG_HANDLE.get() {
        handle.retarget(&settings.dir, &settings.name)?;
        return Ok(handle);
    }

    let (path, logfile) = open_log_file(&settings.dir, &settings.name)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);
    let (file_layer, file_reload) = reload::Layer::new(build_file_layer(file_writer));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&settings.filter)?,
    };
    let (filter_layer, filter_reload) = reload::Layer::new(filter);

    let (terminal_layer, terminal_guard) = if settings.terminal {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        let layer = fmt::layer()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(writer)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter_layer)
        .with(terminal_layer)
        .try_init()
        .map_err(|e| PidError::config(format!("Failed to install logger: {e}")))?;

    Ok(LOG_HANDLE.get_or_init(|| LogHandle {
        file: Mutex::new((path, file_guard)),
        _terminal: Mutex::new(terminal_guard),
        file_reload,
        filter_reload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s: LogSettings = serde_json::from_str(r#"{"name": "rig"}"#).unwrap();
        assert_eq!(s.name, "rig");
        assert_eq!(s.filter, "info");
        assert!(s.terminal);
    }

    #[test]
    fn default_name_is_timestamped() {
        let epoch = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(90_061);
        assert_eq!(default_log_name(epoch), "pidloop_1970-01-02T010101Z");

        let name = LogSettings::default().name;
        assert!(name.starts_with("pidloop_20"));
        assert!(!name.contains(':'));
    }

    #[test]
    fn bad_filter_is_rejected() {
        assert!(matches!(
            parse_filter("pidloop=loudest"),
            Err(PidError::Configuration { .. })
        ));
        assert!(parse_filter("pidloop=trace,info").is_ok());
    }

    // The logger is process-wide, so everything that installs it is in one test
    #[test]
    fn init_twice_retargets_file() {
        let dir = std::env::temp_dir().join(format!("pidloop-logging-{}", std::process::id()));
        let settings = LogSettings {
            dir: dir.clone(),
            name: "first".to_owned(),
            terminal: false,
            ..Default::default()
        };

        let handle = init_logging(&settings).unwrap();
        tracing::info!("first log target");
        assert_eq!(handle.log_path(), dir.join("first.log"));

        let handle = init_logging(&LogSettings {
            name: "second".to_owned(),
            ..settings
        })
        .unwrap();
        tracing::info!("second log target");
        assert_eq!(handle.log_path(), dir.join("second.log"));
        assert!(dir.join("first.log").exists());
        assert!(dir.join("second.log").exists());

        handle.set_filter("pidloop=trace").unwrap();
        assert!(handle.set_filter("pidloop=loudest").is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
