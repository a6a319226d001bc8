//! Leveled logging seam between kernel objects and the host.
//!
//! Every handle carries a shared [`LogSink`]. The default sink forwards to
//! the [`log`] crate facade, so a host that installs no logger discards all
//! output, which is exactly the "absent sink is safe" contract. Tests and
//! embedded-style hosts can substitute [`MemorySink`] or [`NullSink`], or
//! provide their own backend.
//!
//! Line conventions, shared by all object kinds:
//!
//! - DEBUG traces an operation: `Semaphore[tx-credits]::get(Forever)`
//! - INFO marks notable lifecycle events: `Queue[rx]::create() recreating`
//! - ERROR reports a failure with its code: `Semaphore[tx-credits]: sem_get() = 0x10 (object not created)`

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::KernelError;

/// Severity levels accepted by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Error,
}

/// Backend that consumes formatted log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, target: &str, message: fmt::Arguments<'_>);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn LogSink>;

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _severity: Severity, _target: &str, _message: fmt::Arguments<'_>) {}
}

/// Forwards to the [`log`] crate macros. This is the default sink.
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn log(&self, severity: Severity, target: &str, message: fmt::Arguments<'_>) {
        let level = match severity {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Error => log::Level::Error,
        };
        log::log!(target: target, level, "{message}");
    }
}

/// Records every line in memory for later inspection.
pub struct MemorySink {
    lines: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
        })
    }

    /// All recorded lines in arrival order.
    pub fn lines(&self) -> Vec<(Severity, String)> {
        self.lines.lock().clone()
    }

    /// Only the lines recorded at [`Severity::Error`].
    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(severity, _)| *severity == Severity::Error)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(&self, severity: Severity, _target: &str, message: fmt::Arguments<'_>) {
        self.lines.lock().push((severity, message.to_string()));
    }
}

/// The sink every handle starts with unless one is injected.
pub fn default_sink() -> SharedSink {
    Arc::new(FacadeSink)
}

/// Per-object logging context: object kind, instance name, sink.
#[derive(Clone)]
pub(crate) struct ObjectLog {
    kind: &'static str,
    target: &'static str,
    name: Arc<str>,
    sink: SharedSink,
}

impl ObjectLog {
    pub(crate) fn new(
        kind: &'static str,
        target: &'static str,
        name: String,
        sink: SharedSink,
    ) -> Self {
        Self {
            kind,
            target,
            name: name.into(),
            sink,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn sink(&self) -> SharedSink {
        Arc::clone(&self.sink)
    }

    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        self.sink.log(
            Severity::Debug,
            self.target,
            format_args!("{}[{}]::{}", self.kind, self.name, args),
        );
    }

    pub(crate) fn info(&self, args: fmt::Arguments<'_>) {
        self.sink.log(
            Severity::Info,
            self.target,
            format_args!("{}[{}]::{}", self.kind, self.name, args),
        );
    }

    pub(crate) fn error(&self, args: fmt::Arguments<'_>) {
        self.sink.log(
            Severity::Error,
            self.target,
            format_args!("{}[{}]: {}", self.kind, self.name, args),
        );
    }

    /// ERROR line for a failed raw operation: `op() = 0xNN (description)`.
    pub(crate) fn error_status(&self, op: &str, err: KernelError) {
        self.error(format_args!("{}() = {:#04x} ({})", op, err.code(), err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.log(Severity::Debug, "t", format_args!("first"));
        sink.log(Severity::Error, "t", format_args!("second"));

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Severity::Debug, "first".to_string()));
        assert_eq!(lines[1], (Severity::Error, "second".to_string()));
        assert_eq!(sink.errors(), vec!["second".to_string()]);
    }

    #[test]
    fn object_log_formats_kind_and_name() {
        let sink = MemorySink::new();
        let log = ObjectLog::new("Semaphore", "keel::semaphore", "credits".into(), sink.clone());

        log.debug(format_args!("get(Forever)"));
        log.error_status("sem_get", KernelError::NotCreated);

        let lines = sink.lines();
        assert_eq!(lines[0].1, "Semaphore[credits]::get(Forever)");
        assert_eq!(lines[1].1, "Semaphore[credits]: sem_get() = 0x10 (object not created)");
    }

    #[test]
    fn null_sink_discards() {
        // Compiles and does nothing; the contract is the absence of effects.
        NullSink.log(Severity::Error, "t", format_args!("dropped"));
    }
}
