use crate::common::message::{MailMessage, SmtpMailMessage};
use crate::common::session::{self, Role, SessionHandle, SessionTask, SessionWorker};
use crate::common::sink::{MailSink, Severity};
use crate::common::transport::Transport;
use chrono::Local;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Connects, handshakes, logs in, and spawns the session worker
///
/// The returned handle is the caller's way to submit sends and the graceful
/// disconnect. A declined login or connect failure is an error; no session
/// is created.
pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    sink: Arc<dyn MailSink>,
) -> Result<SessionHandle, String> {
    crate::log_info!("Attempting to connect to {}:{}", host, port);

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| format!("Unable to connect to {}:{}: {}", host, port, e))?;

    let local_host = stream
        .local_addr()
        .map_err(|e| format!("Unable to read local address: {}", e))?
        .ip()
        .to_string();

    let mut transport = Transport::new(stream, local_host, sink.clone())?;
    session::client_handshake(&mut transport, &*sink).await?;

    let accepted = session::client_login(&mut transport, &*sink, username, password).await?;
    if !accepted {
        transport.close().await;
        return Err(format!("Login declined for {}", username));
    }

    let (worker, handle) = SessionWorker::new(Role::Client, username, transport, sink);
    tokio::spawn(worker.run());
    Ok(handle)
}

/// Builds a message stamped with today's date
pub fn compose(
    sender: &str,
    to: Vec<String>,
    cc: Vec<String>,
    subject: &str,
    body: &str,
    encrypted: bool,
) -> MailMessage {
    MailMessage {
        encrypted,
        sender: sender.to_string(),
        to,
        cc,
        date: Local::now().format("%Y-%m-%d").to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
    }
}

/// Submits a composed message to the session; false when the session is gone
pub fn send(handle: &SessionHandle, mail: MailMessage) -> bool {
    handle.submit(SessionTask::SendMail {
        mail,
        envelope: None,
    })
}

/// Asks the session to QUIT and tear down
pub fn disconnect(handle: &SessionHandle) {
    if !handle.submit(SessionTask::Disconnect) {
        handle.halt();
    }
}

/// Console rendering of deliveries and dialogs for the terminal client
pub struct ConsoleSink;

impl MailSink for ConsoleSink {
    fn show_dialog(&self, text: &str, title: &str, severity: Severity) {
        crate::log_info!("[{}] {}: {}", severity, title, text);
    }

    fn on_mail_received(&self, mail: SmtpMailMessage) {
        crate::log_info!("--- New mail ---");
        crate::log_info!("{}", mail.mail);
    }

    fn on_disconnect(&self) {
        crate::log_info!("Disconnected from server");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_fills_fields() {
        let mail = compose(
            "alice@srv",
            vec!["bob@srv".to_string()],
            vec!["carol@srv".to_string()],
            "hi",
            "hello\nthere",
            true,
        );

        assert!(mail.encrypted);
        assert_eq!(mail.sender, "alice@srv");
        assert_eq!(mail.to, vec!["bob@srv"]);
        assert_eq!(mail.cc, vec!["carol@srv"]);
        assert_eq!(mail.subject, "hi");
        assert_eq!(mail.body, "hello\nthere");
        assert!(!mail.date.is_empty());
    }
}
