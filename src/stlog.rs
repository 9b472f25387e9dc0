// Copyright 2022 System Transparency Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide leveled log sink behind the `log` facade.
//!
//! Messages carry a fixed `stboot: ` line prefix and a level tag.  The
//! backend is switchable between a generic byte stream (stderr by
//! default) and the kernel message ring buffer, which is the only sink
//! visible once stboot runs as early init.

use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::errors::{op, Error, Result, Scope};

const KMSG_PATH: &str = "/dev/kmsg";

/// Log backend selector.
pub enum Target {
    /// Write rendered lines to an arbitrary byte sink.
    Stream(Box<dyn Write + Send>),
    /// Write to the kernel message ring buffer.
    Kmsg,
}

enum Backend {
    Stream(Box<dyn Write + Send>),
    Kmsg(std::fs::File),
}

struct StLogger {
    // encoded LevelFilter; updates must be visible to all callers
    level: AtomicUsize,
    backend: Mutex<Backend>,
}

lazy_static! {
    static ref LOGGER: StLogger = StLogger {
        level: AtomicUsize::new(encode_filter(LevelFilter::Info)),
        backend: Mutex::new(Backend::Stream(Box::new(io::stderr()))),
    };
}

/// Install the sink as the process logger.  May be called once.
pub fn init() -> Result<()> {
    log::set_logger(&*LOGGER).map_err(|_| {
        Error::new()
            .scope(Scope::Stlog)
            .op(op::VALIDATE)
            .info("logger already initialized")
    })?;
    log::set_max_level(LOGGER.filter());
    Ok(())
}

/// Update the emission threshold.  Takes effect immediately for all
/// subsequent emissions from any thread.
pub fn set_level(level: LevelFilter) {
    LOGGER.level.store(encode_filter(level), Ordering::SeqCst);
    log::set_max_level(level);
}

/// Parse a level name; anything unrecognized means the most verbose
/// setting so that diagnostics are never lost to a typo.
pub fn level_from_str(s: &str) -> LevelFilter {
    LevelFilter::from_str(s).unwrap_or(LevelFilter::Debug)
}

/// Replace the log backend.
pub fn set_output(target: Target) -> Result<()> {
    let backend = match target {
        Target::Stream(w) => Backend::Stream(w),
        Target::Kmsg => {
            let file = OpenOptions::new()
                .write(true)
                .open(KMSG_PATH)
                .map_err(|e| {
                    Error::new()
                        .scope(Scope::Stlog)
                        .op(op::NO_PERMISSION)
                        .info(format!("opening {KMSG_PATH}"))
                        .cause_other(e.into())
                })?;
            Backend::Kmsg(file)
        }
    };
    if let Ok(mut guard) = LOGGER.backend.lock() {
        *guard = backend;
    }
    Ok(())
}

impl StLogger {
    fn filter(&self) -> LevelFilter {
        decode_filter(self.level.load(Ordering::SeqCst))
    }
}

impl Log for StLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Ok(mut backend) = self.backend.lock() else {
            return;
        };
        // a failing sink must never take the boot down with it
        let _ = match &mut *backend {
            Backend::Stream(w) => {
                writeln!(w, "stboot: {}{}", level_tag(record.level()), record.args())
            }
            Backend::Kmsg(f) => writeln!(
                f,
                "<{}>stboot: {}{}",
                kmsg_priority(record.level()),
                level_tag(record.level()),
                record.args()
            ),
        };
    }

    fn flush(&self) {
        if let Ok(mut backend) = self.backend.lock() {
            let _ = match &mut *backend {
                Backend::Stream(w) => w.flush(),
                Backend::Kmsg(f) => f.flush(),
            };
        }
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR] ",
        Level::Warn => "[WARN] ",
        Level::Info => "[INFO] ",
        Level::Debug | Level::Trace => "[DEBUG] ",
    }
}

/// Kernel syslog priority for a level (err, warning, info, debug).
fn kmsg_priority(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    }
}

fn encode_filter(filter: LevelFilter) -> usize {
    match filter {
        LevelFilter::Off => 0,
        LevelFilter::Error => 1,
        LevelFilter::Warn => 2,
        LevelFilter::Info => 3,
        LevelFilter::Debug => 4,
        LevelFilter::Trace => 5,
    }
}

fn decode_filter(raw: usize) -> LevelFilter {
    match raw {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_level_defaults_to_debug() {
        assert_eq!(level_from_str("warn"), LevelFilter::Warn);
        assert_eq!(level_from_str("ERROR"), LevelFilter::Error);
        assert_eq!(level_from_str("chatty"), LevelFilter::Debug);
        assert_eq!(level_from_str(""), LevelFilter::Debug);
    }

    #[test]
    fn kmsg_priorities_match_syslog() {
        assert_eq!(kmsg_priority(Level::Error), 3);
        assert_eq!(kmsg_priority(Level::Warn), 4);
        assert_eq!(kmsg_priority(Level::Info), 6);
        assert_eq!(kmsg_priority(Level::Debug), 7);
    }

    #[test]
    fn filter_encoding_roundtrips() {
        for filter in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(decode_filter(encode_filter(filter)), filter);
        }
    }

    /// Emission gating and level switching, exercised through the real
    /// global sink.  Kept in one test because the logger is process-wide.
    #[test]
    fn emission_respects_level_and_prefix() {
        let _ = init();
        let buf = SharedBuf::default();
        set_output(Target::Stream(Box::new(buf.clone()))).unwrap();

        set_level(LevelFilter::Warn);
        log::error!("gating-err {}", 1);
        log::warn!("gating-warn");
        log::info!("gating-info");
        log::debug!("gating-debug");

        let out = buf.contents();
        assert!(out.contains("stboot: [ERROR] gating-err 1\n"));
        assert!(out.contains("stboot: [WARN] gating-warn\n"));
        assert!(!out.contains("gating-info"));
        assert!(!out.contains("gating-debug"));

        // raising the level is visible to the very next emission
        set_level(LevelFilter::Debug);
        log::debug!("gating-debug");
        assert!(buf.contents().contains("stboot: [DEBUG] gating-debug\n"));

        set_level(LevelFilter::Info);
    }
}
