//! Process-wide sink for vat-fatal and kernel-fatal conditions.
//!
//! Install one at startup with [`install_error_sink`]. Until then reports go
//! to `log::error!`.

use once_cell::sync::OnceCell;

use crate::KernelError;

pub trait ErrorSink: Send + Sync {
    fn report(&self, vat_id: Option<&str>, err: &KernelError);
}

/// Default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, vat_id: Option<&str>, err: &KernelError) {
        match vat_id {
            Some(vat_id) => log::error!("vat {vat_id}: {err}"),
            None => log::error!("kernel: {err}"),
        }
    }
}

static ERROR_SINK: OnceCell<Box<dyn ErrorSink>> = OnceCell::new();

/// Install the sink. Only the first call wins; later calls get their sink back.
pub fn install_error_sink(sink: Box<dyn ErrorSink>) -> Result<(), Box<dyn ErrorSink>> {
    ERROR_SINK.set(sink)
}

pub fn report(vat_id: Option<&str>, err: &KernelError) {
    match ERROR_SINK.get() {
        Some(sink) => sink.report(vat_id, err),
        None => LogSink.report(vat_id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<String>>>);

    impl ErrorSink for Collect {
        fn report(&self, vat_id: Option<&str>, err: &KernelError) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}: {err}", vat_id.unwrap_or("-")));
        }
    }

    #[test]
    fn first_installed_sink_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        // the only test in this binary that installs a sink
        assert!(install_error_sink(Box::new(Collect(seen.clone()))).is_ok());
        assert!(install_error_sink(Box::new(LogSink)).is_err());

        report(Some("v9"), &KernelError::VatNotFound("v9".into()));
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|line| line == "v9: vat 'v9' not found")
        );
    }
}
