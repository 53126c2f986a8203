use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;

pub const TIME_FORMAT: &str = "%d/%m/%Y %I:%M:%S %p";

/// Installs the global subscriber writing to `log_file`, rotated at midnight.
///
/// Rotated files are named `<file name>.<YYYY-MM-DD>`. The returned guard
/// flushes buffered lines when dropped and must be held until exit.
pub fn init(log_file: &Path, level: LevelFilter) -> Result<WorkerGuard, InitError> {
    let (writer, guard) = tracing_appender::non_blocking(appender(log_file)?);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(level)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(false)
        .with_ansi(false)
        .init();
    Ok(guard)
}

/// Daily appender for `log_file`; fails if its directory cannot be created.
pub fn appender(log_file: &Path) -> Result<RollingFileAppender, InitError> {
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = log_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "form-mailer.log".into());

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .build(dir)
}
