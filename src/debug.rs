//! Debug logging for dpmi-mem.
//!
//! The crate logs through the `log` facade. Embedders with their own logger
//! need nothing from this module; everyone else can call [`init`] and set the
//! `DPMI_MEM_DEBUG` environment variable:
//! - `DPMI_MEM_DEBUG=1` - Enable all debug output
//! - `DPMI_MEM_DEBUG=mapping` - Enable only mapping backend logs
//! - `DPMI_MEM_DEBUG=dpmi` - Enable only block manager logs
//! - `DPMI_MEM_DEBUG=mapping,dpmi` - Enable multiple categories
//!
//! Warnings and errors are always printed once the logger is installed.

use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Mapping,
    Dpmi,
    All,
}

impl DebugCategory {
    /// Category of a log target, if it belongs to this crate.
    fn of_target(target: &str) -> Option<Self> {
        let path = target.strip_prefix("dpmi_mem::")?;
        if path.starts_with("mapping") || path.starts_with("space") {
            Some(DebugCategory::Mapping)
        } else if path.starts_with("dpmi") || path.starts_with("memory") {
            Some(DebugCategory::Dpmi)
        } else {
            Some(DebugCategory::All)
        }
    }
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    mapping: bool,
    dpmi: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("DPMI_MEM_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }

    fn parse(val: &str) -> Self {
        let val_lower = val.to_lowercase();
        if val_lower == "1" || val_lower == "all" {
            return Self {
                enabled: true,
                mapping: true,
                dpmi: true,
            };
        }
        Self {
            enabled: true,
            mapping: val_lower.contains("mapping"),
            dpmi: val_lower.contains("dpmi"),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.mapping || self.dpmi,
            DebugCategory::Mapping => self.mapping,
            DebugCategory::Dpmi => self.dpmi,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Logger writing to stderr, filtered by `DPMI_MEM_DEBUG`.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        if metadata.level() <= Level::Warn {
            return true;
        }
        match DebugCategory::of_target(metadata.target()) {
            Some(category) => is_debug_enabled(category),
            None => false,
        }
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Install the stderr logger. Returns `false` if another logger was already
/// set.
pub fn init() -> bool {
    if log::set_logger(&LOGGER).is_err() {
        return false;
    }
    let level = if get_config().enabled {
        LevelFilter::Trace
    } else {
        LevelFilter::Warn
    };
    log::set_max_level(level);
    true
}
