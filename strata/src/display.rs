//! Human-readable progress lines.

use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::time::Duration;
use strata_core::{ProgressSink, Stat, Throughput};

/// Format bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Format a duration as `m:ss`, or `h:mm:ss` past the hour.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Counts entries while a directory is scanned.
pub struct ScanProgress;

impl ProgressSink for ScanProgress {
    fn update(&self, stat: &Stat, elapsed: Duration, _ticker: bool) {
        status_line(&format!(
            "[{}] scanning: {} dirs, {} files, {}",
            format_duration(elapsed),
            stat.dirs,
            stat.files,
            format_bytes(stat.bytes)
        ));
    }

    fn done(&self, stat: &Stat, elapsed: Duration) {
        status_line(&format!(
            "scanned {} dirs, {} files, {} in {}",
            stat.dirs,
            stat.files,
            format_bytes(stat.bytes),
            format_duration(elapsed)
        ));
        eprintln!();
    }
}

/// Throughput and ETA against a known amount of work.
pub struct ArchiveProgress {
    todo: Stat,
}

impl ArchiveProgress {
    pub fn new(todo: Stat) -> Self {
        Self { todo }
    }

    fn line(&self, stat: &Stat, elapsed: Duration) -> String {
        let t = Throughput::compute(stat, &self.todo, elapsed);
        let eta = t.eta.map(format_duration).unwrap_or_else(|| "-".to_string());
        format!(
            "[{}] {:3.2}%  {}/s  {} / {}  {} / {} items  ETA {}",
            format_duration(elapsed),
            t.percent,
            format_bytes(t.bytes_per_sec),
            format_bytes(stat.bytes),
            format_bytes(self.todo.bytes),
            stat.items(),
            self.todo.items(),
            eta
        )
    }
}

impl ProgressSink for ArchiveProgress {
    fn update(&self, stat: &Stat, elapsed: Duration, _ticker: bool) {
        status_line(&self.line(stat, elapsed));
    }

    fn done(&self, stat: &Stat, elapsed: Duration) {
        let t = Throughput::compute(stat, &self.todo, elapsed);
        status_line(&format!(
            "archived {} files, {} dirs, {} in {} ({}/s)",
            stat.files,
            stat.dirs,
            format_bytes(stat.bytes),
            format_duration(elapsed),
            format_bytes(t.bytes_per_sec)
        ));
        eprintln!();
    }
}

/// Erases the current terminal line and returns to its start.
const CLEAR_LINE: &str = "\x1b[2K\r";

/// Overwrite the current terminal line.
fn status_line(text: &str) {
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "{}{}", CLEAR_LINE, text);
    let _ = stderr.flush();
}

/// Print a failed item on its own line, clearing any live status line first.
pub fn print_error(path: &Path, err: &dyn Display) {
    let mut stderr = io::stderr().lock();
    let live = stderr.is_terminal();
    let _ = stderr.write_all(error_line(path, err, live).as_bytes());
    let _ = stderr.flush();
}

fn error_line(path: &Path, err: &dyn Display, live: bool) -> String {
    let clear = if live { CLEAR_LINE } else { "" };
    format!("{}error for {}: {}\n", clear, path.display(), err)
}
