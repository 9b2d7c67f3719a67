use crate::common::message::SmtpMailMessage;
use std::fmt;

/// How loud a dialog should be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Contract between the protocol engine and whatever shell hosts it
///
/// The server wires this to its dispatcher and session map, the client to its
/// console (or window) surface. Implementations must be callable from any
/// session task.
pub trait MailSink: Send + Sync {
    /// Surfaces a user-facing notice
    fn show_dialog(&self, text: &str, title: &str, severity: Severity);

    /// Writes one line of wire traffic or status to the host's log
    fn log(&self, line: &str) {
        crate::verbose!("{}", line);
    }

    /// Called for every fully received message
    fn on_mail_received(&self, mail: SmtpMailMessage);

    /// Notifies the host that this session's connection has ended
    fn on_disconnect(&self) {}

    /// Alerts the server that a user's session has terminated
    fn on_user_disconnect(&self, _username: &str) {}
}

/// Log-only sink for sessions nobody is watching (relay workers, tests)
pub struct LogSink;

impl MailSink for LogSink {
    fn show_dialog(&self, text: &str, title: &str, severity: Severity) {
        crate::log_info!("[{}] {}: {}", severity, title, text);
    }

    fn on_mail_received(&self, mail: SmtpMailMessage) {
        crate::verbose!("Discarding mail received on relay session from {}", mail.smtp_from);
    }
}
