// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Logger setup. Mirrors the teacher's `SimpleLogger` usage in
//! `dcompass/src/main.rs`, extended with a file-output path since
//! `simple_logger` only ever writes to stderr.

use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

/// A `log::Log` implementation that writes formatted lines to an open
/// file instead of stderr, used when `--logfile` is set. `simple_logger`
/// has no file-output mode of its own, so this is a minimal stand-in that
/// matches its line format closely enough for operators used to one or
/// the other.
struct FileLogger {
    level: LevelFilter,
    file: Mutex<std::fs::File>,
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut file = self.file.lock().expect("logfile mutex poisoned");
        let _ = writeln!(
            file,
            "{} {} [{}] {}",
            humantime_now(),
            record.level(),
            record.target(),
            record.args()
        );
        let _ = file.flush();
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// A timestamp good enough for log lines without pulling in a dedicated
/// time-formatting crate for this one call site.
fn humantime_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("+{}s", secs)
}

/// Initialize logging at `level`, to `logfile` if given, otherwise stderr.
pub fn init(level: LevelFilter, logfile: Option<&str>) -> anyhow::Result<()> {
    match logfile {
        None => {
            SimpleLogger::new().with_level(level).init()?;
        }
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let logger = FileLogger {
                level,
                file: Mutex::new(file),
            };
            log::set_boxed_logger(Box::new(logger))?;
            log::set_max_level(level);
        }
    }
    Ok(())
}
