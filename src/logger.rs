//! Session log: one truncated file per process run.
//!
//! Default location is `<data dir>/curveforge/curveforge.log`, where the data
//! dir is `%APPDATA%` on Windows, `~/Library/Application Support` on macOS
//! and `$XDG_DATA_HOME` (or `~/.local/share`) elsewhere.  Setting
//! `CURVEFORGE_LOG` overrides the whole path.
//!
//! Until [`init`] runs every write is dropped, so library users that never
//! initialise the logger pay nothing.  Log through `log_info!`, `log_warn!`
//! and `log_err!`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

struct Session {
    path: PathBuf,
    file: Mutex<File>,
}

static SESSION: OnceLock<Session> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Panic,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Panic => "PANIC",
        })
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, format_args!($($arg)*))
    };
}

/// Path of the active log file, if [`init`] succeeded.
pub fn log_path() -> Option<&'static PathBuf> {
    SESSION.get().map(|s| &s.path)
}

/// Append one `[hh:mm:ss.mmm] [LEVEL] message` line.  I/O errors are ignored.
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    let Some(session) = SESSION.get() else {
        return;
    };
    if let Ok(mut file) = session.file.lock() {
        let _ = writeln!(file, "[{}] [{}] {}", clock(), level, args);
    }
}

/// Open the default log file and hook panics into it.
pub fn init() {
    let path = std::env::var_os("CURVEFORGE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("curveforge").join("curveforge.log"));
    init_at(path);
}

/// [`init`] with an explicit file.  The first successful call wins.
pub fn init_at(path: PathBuf) {
    if SESSION.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] cannot open {}: {}", path.display(), e);
            return;
        }
    };
    let session = Session {
        path,
        file: Mutex::new(file),
    };
    if SESSION.set(session).is_err() {
        return;
    }

    if let Some(session) = SESSION.get()
        && let Ok(mut file) = session.file.lock()
    {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let _ = writeln!(
            file,
            "=== curveforge {} (unix {}) pid {} ===",
            env!("CARGO_PKG_VERSION"),
            unix,
            std::process::id()
        );
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write(Level::Panic, format_args!("{}", info));
        previous(info);
    }));
}

fn data_dir() -> PathBuf {
    let env = |key: &str| std::env::var_os(key).map(PathBuf::from);
    if cfg!(target_os = "windows")
        && let Some(appdata) = env("APPDATA")
    {
        return appdata;
    }
    if cfg!(target_os = "macos")
        && let Some(home) = env("HOME")
    {
        return home.join("Library").join("Application Support");
    }
    env("XDG_DATA_HOME")
        .or_else(|| env("HOME").map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// UTC wall-clock time of day with milliseconds.
fn clock() -> String {
    let Ok(d) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return "--:--:--.---".to_string();
    };
    let secs = d.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        d.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_log_receives_macro_lines() {
        let path = std::env::temp_dir()
            .join(format!("curveforge-log-{}", uuid::Uuid::new_v4()))
            .join("session.log");
        init_at(path.clone());
        // Another test may have initialised first; only check our own file.
        if log_path() != Some(&path) {
            return;
        }
        crate::log_warn!("tile {} retried", 7);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("=== curveforge"));
        assert!(text.contains("[WARN] tile 7 retried"));
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn clock_has_millisecond_field() {
        let ts = clock();
        assert_eq!(ts.len(), 12);
        assert_eq!(ts.matches(':').count(), 2);
        assert_eq!(&ts[8..9], ".");
    }

    #[test]
    fn levels_render_upper_case() {
        assert_eq!(Level::Warn.to_string(), "WARN");
        assert_eq!(Level::Panic.to_string(), "PANIC");
    }
}
