use crate::common::codec;
use crate::common::message::{MailMessage, SmtpMailMessage};
use crate::common::sink::{MailSink, Severity};
use crate::common::transport::Transport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Global session ID counter
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How long the loop sleeps when a tick finds nothing to do
const IDLE_TICK: Duration = Duration::from_millis(150);

/// Which end of the protocol this worker speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Deferred work executed on the session's own loop
///
/// Tasks arrive from any producer and run serialized with the loop's own
/// socket reads, so every write on the connection happens in inbox order.
pub enum SessionTask {
    /// Send a message out over this connection
    ///
    /// When `envelope` is absent the RCPT lines are derived from the display
    /// to/cc lists; a relay passes the one recipient it is forwarding to.
    SendMail {
        mail: MailMessage,
        envelope: Option<Vec<String>>,
    },
    /// Graceful termination: QUIT, await the farewell, close the socket
    Disconnect,
}

/// Thread-safe handle producers use to reach a session's task inbox
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    username: String,
    inbox: mpsc::UnboundedSender<SessionTask>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Enqueues a task; false when the session loop is already gone
    pub fn submit(&self, task: SessionTask) -> bool {
        self.inbox.send(task).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Abrupt termination: clears the flag directly; the loop observes it
    /// within one tick and the caller is responsible for the transport
    pub fn halt(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// One cooperative command loop per connection
///
/// Each tick drains the task inbox, probes the transport for a line, and
/// otherwise sleeps briefly. Runs until `connected` clears.
pub struct SessionWorker {
    role: Role,
    username: String,
    transport: Transport,
    sink: Arc<dyn MailSink>,
    inbox: mpsc::UnboundedReceiver<SessionTask>,
    connected: Arc<AtomicBool>,
}

impl SessionWorker {
    pub fn new(
        role: Role,
        username: impl Into<String>,
        transport: Transport,
        sink: Arc<dyn MailSink>,
    ) -> (Self, SessionHandle) {
        let id = SESSION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let username = username.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let handle = SessionHandle {
            id,
            username: username.clone(),
            inbox: tx,
            connected: connected.clone(),
        };

        let worker = Self {
            role,
            username,
            transport,
            sink,
            inbox: rx,
            connected,
        };

        (worker, handle)
    }

    pub async fn run(mut self) {
        while self.connected.load(Ordering::SeqCst) {
            self.drain_tasks().await;

            if !self.connected.load(Ordering::SeqCst) {
                break;
            }

            if self.transport.has_data().await {
                match self.transport.read_line().await {
                    Ok(line) => {
                        if let Err(err) = self.dispatch_line(line).await {
                            self.fail(err);
                        }
                    }
                    Err(err) => self.fail(err),
                }
            } else {
                tokio::time::sleep(IDLE_TICK).await;
            }
        }

        self.transport.close().await;

        match self.role {
            Role::Server => self.sink.on_user_disconnect(&self.username),
            Role::Client => self.sink.on_disconnect(),
        }
    }

    fn fail(&mut self, err: String) {
        crate::log_error!("Session for {} terminated: {}", self.username, err);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Runs every task currently in the inbox, in enqueue order
    async fn drain_tasks(&mut self) {
        while let Ok(task) = self.inbox.try_recv() {
            match task {
                SessionTask::SendMail { mail, envelope } => {
                    if mail.sender.is_empty() {
                        self.sink.show_dialog(
                            "Cannot send a message with no from address",
                            "Send failed",
                            Severity::Error,
                        );
                        continue;
                    }

                    let rcpt_lines = match &envelope {
                        Some(addrs) => codec::rcpt_to_lines(addrs, &[]),
                        None => codec::rcpt_to_lines(&mail.to, &mail.cc),
                    };

                    if rcpt_lines.is_empty() {
                        self.sink.show_dialog(
                            "Cannot send a message without any recipients",
                            "Send failed",
                            Severity::Error,
                        );
                        continue;
                    }

                    if let Err(err) = self.send_outgoing_mail(&mail, &rcpt_lines).await {
                        self.fail(err);
                        return;
                    }
                }
                SessionTask::Disconnect => {
                    if let Err(err) = self.send_disconnect().await {
                        crate::verbose!("Error during disconnect: {}", err);
                    }
                    self.connected.store(false, Ordering::SeqCst);
                    self.transport.close().await;
                    return;
                }
            }
        }
    }

    /// Routes one inbound line; commands compare case-insensitively
    async fn dispatch_line(&mut self, line: String) -> Result<(), String> {
        let upper = line.to_uppercase();

        if upper.starts_with("MAIL FROM") {
            let mail = self.read_incoming_mail(&line).await?;
            self.sink.on_mail_received(mail);
        } else if upper == "QUIT" {
            self.sink.log(&line);
            let farewell = codec::farewell(self.transport.local_hostname());
            self.transport.send_line(&farewell).await?;
            self.connected.store(false, Ordering::SeqCst);
        } else if line.starts_with("500") {
            self.sink
                .show_dialog(&line, "Remote reported an error", Severity::Warning);
        } else if self.role == Role::Server {
            self.sink.log(&line);
            self.transport.send_line(&codec::unknown_command()).await?;
        } else {
            // stray acknowledgments on the client side only surface in the log
            self.sink.log(&line);
        }

        Ok(())
    }

    /// Reads a full envelope and body, acknowledging each step
    ///
    /// `first_line` is the already-consumed MAIL FROM line. Honors each RCPT
    /// with 250, answers DATA with 354, collects body lines to the `.`
    /// terminator, and reverse-substitutes when the marker asks for it.
    async fn read_incoming_mail(&mut self, first_line: &str) -> Result<SmtpMailMessage, String> {
        self.sink.log(first_line);
        let smtp_from = codec::envelope_address(first_line);
        self.transport.send_line(&codec::ok_reply()).await?;

        let mut recipients = Vec::new();
        let mut next = self.transport.read_line().await?;
        while next.to_uppercase().starts_with("RCPT TO") {
            self.sink.log(&next);

            let recipient = codec::envelope_address(&next);
            if !recipient.is_empty() {
                recipients.push(recipient);
            }

            self.transport.send_line(&codec::ok_reply()).await?;
            next = self.transport.read_line().await?;
        }

        // the line past the recipients is the DATA header
        self.sink.log(&next);
        self.transport.send_line(&codec::end_data_with()).await?;

        let marker = self.transport.read_line().await?;
        self.sink.log(&marker);
        let encrypted = marker == codec::ENCRYPTED_MARKER;

        let mut contents = Vec::new();
        let mut line = self.transport.read_line().await?;
        while line != codec::DATA_TERMINATOR {
            self.sink.log(&line);
            contents.push(line);
            line = self.transport.read_line().await?;
        }
        self.sink.log(&line);

        self.transport.send_line(&codec::ok_reply()).await?;

        if encrypted {
            contents = codec::caesar_shift(&contents, 26 - codec::SHIFT_AMOUNT);
        }

        Ok(SmtpMailMessage::from_wire(
            encrypted, smtp_from, recipients, contents,
        ))
    }

    /// Sends a message over this connection, awaiting each acknowledgment
    async fn send_outgoing_mail(
        &mut self,
        mail: &MailMessage,
        rcpt_lines: &[String],
    ) -> Result<(), String> {
        let from_line = codec::mail_from_line(&mail.sender);
        self.transport.send_line(&from_line).await?;
        self.read_reply().await?;

        for line in rcpt_lines {
            self.transport.send_line(line).await?;
            self.read_reply().await?;
        }

        self.transport.send_line(codec::DATA_HEADER).await?;
        self.read_reply().await?;

        for line in codec::format_body_for_send(mail) {
            self.transport.send_line(&line).await?;
        }

        self.transport.send_line(codec::DATA_TERMINATOR).await?;
        self.read_reply().await?;

        Ok(())
    }

    async fn read_reply(&mut self) -> Result<String, String> {
        let reply = self.transport.read_line().await?;
        self.sink.log(&reply);
        Ok(reply)
    }

    /// Notifies the remote of our intent to disconnect, then awaits the 221
    async fn send_disconnect(&mut self) -> Result<(), String> {
        self.transport.send_line("QUIT").await?;
        let farewell = self.transport.read_line().await?;
        self.sink.log(&farewell);
        Ok(())
    }
}

/// Server side of the greeting exchange
pub async fn server_handshake(transport: &mut Transport, sink: &dyn MailSink) -> Result<(), String> {
    let greeting = codec::greeting(transport.local_hostname());
    transport.send_line(&greeting).await?;

    let helo = transport.read_line().await?;
    sink.log(&helo);

    let ack = codec::hello_ack(transport.peer_hostname());
    transport.send_line(&ack).await?;
    Ok(())
}

/// Client side of the greeting exchange
pub async fn client_handshake(transport: &mut Transport, sink: &dyn MailSink) -> Result<(), String> {
    let greeting = transport.read_line().await?;
    sink.log(&greeting);

    let helo = format!("HELO {}", transport.local_hostname());
    transport.send_line(&helo).await?;

    let ack = transport.read_line().await?;
    sink.log(&ack);
    Ok(())
}

/// Client half of the LOGIN sub-handshake; true when the server accepted
pub async fn client_login(
    transport: &mut Transport,
    sink: &dyn MailSink,
    username: &str,
    password: &str,
) -> Result<bool, String> {
    transport.send_line(username).await?;
    transport.send_line_hidden(password).await?;

    let response = transport.read_line().await?;
    sink.log(&response);
    Ok(response == codec::LOGIN_ACCEPTED)
}

/// Server half of the LOGIN sub-handshake: reads the credential pair
pub async fn read_login(
    transport: &mut Transport,
    sink: &dyn MailSink,
) -> Result<(String, String), String> {
    let username = transport.read_line().await?;
    sink.log(&username);

    let password = transport.read_line().await?;
    sink.log(&"*".repeat(password.chars().count()));

    Ok((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::sink::LogSink;
    use std::sync::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    struct CollectSink {
        mails: Mutex<Vec<SmtpMailMessage>>,
        departed: Mutex<Vec<String>>,
    }

    impl CollectSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                mails: Mutex::new(Vec::new()),
                departed: Mutex::new(Vec::new()),
            })
        }
    }

    impl MailSink for CollectSink {
        fn show_dialog(&self, _text: &str, _title: &str, _severity: Severity) {}
        fn log(&self, _line: &str) {}

        fn on_mail_received(&self, mail: SmtpMailMessage) {
            self.mails.lock().unwrap().push(mail);
        }

        fn on_user_disconnect(&self, username: &str) {
            self.departed.lock().unwrap().push(username.to_string());
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    async fn wait_for_mail(sink: &Arc<CollectSink>) -> SmtpMailMessage {
        for _ in 0..100 {
            if let Some(mail) = sink.mails.lock().unwrap().first().cloned() {
                return mail;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no mail arrived");
    }

    fn plain_mail() -> MailMessage {
        let mut mail = MailMessage::default();
        mail.sender = "alice@srv".to_string();
        mail.to = vec!["bob@srv".to_string()];
        mail.date = "2024-01-02".to_string();
        mail.subject = "hi".to_string();
        mail.body = "hello".to_string();
        mail
    }

    #[tokio::test]
    async fn test_handshake_and_login() {
        let (server_stream, client_stream) = tcp_pair().await;

        let server = tokio::spawn(async move {
            let mut transport =
                Transport::new(server_stream, "srv.example", Arc::new(LogSink)).unwrap();
            server_handshake(&mut transport, &LogSink).await.unwrap();
            let (user, pass) = read_login(&mut transport, &LogSink).await.unwrap();
            transport.send_line(codec::LOGIN_ACCEPTED).await.unwrap();
            (user, pass)
        });

        let mut transport =
            Transport::new(client_stream, "clt.example", Arc::new(LogSink)).unwrap();
        client_handshake(&mut transport, &LogSink).await.unwrap();
        let accepted = client_login(&mut transport, &LogSink, "alice", "hunter2")
            .await
            .unwrap();

        assert!(accepted);
        assert_eq!(
            server.await.unwrap(),
            ("alice".to_string(), "hunter2".to_string())
        );
    }

    #[tokio::test]
    async fn test_worker_delivers_sent_mail_to_receiving_worker() {
        let (server_stream, client_stream) = tcp_pair().await;
        let received = CollectSink::new();

        let server_sink: Arc<dyn MailSink> = received.clone();
        let server_transport =
            Transport::new(server_stream, "srv.example", server_sink.clone()).unwrap();
        let (server_worker, _server_handle) =
            SessionWorker::new(Role::Server, "alice", server_transport, server_sink);
        tokio::spawn(server_worker.run());

        let client_sink: Arc<dyn MailSink> = Arc::new(LogSink);
        let client_transport =
            Transport::new(client_stream, "clt.example", client_sink.clone()).unwrap();
        let (client_worker, client_handle) =
            SessionWorker::new(Role::Client, "alice", client_transport, client_sink);
        tokio::spawn(client_worker.run());

        assert!(client_handle.submit(SessionTask::SendMail {
            mail: plain_mail(),
            envelope: None,
        }));

        let mail = wait_for_mail(&received).await;
        assert_eq!(mail.smtp_from, "alice@srv");
        assert_eq!(mail.smtp_recipients, vec!["bob@srv"]);
        assert_eq!(mail.mail.sender, "alice@srv");
        assert_eq!(mail.mail.subject, "hi");
        assert!(!mail.mail.encrypted);
        assert!(mail.mail.body.starts_with("From: alice@srv\n"));
        assert!(mail.mail.body.ends_with("hello\n"));
    }

    #[tokio::test]
    async fn test_encrypted_body_is_shifted_on_wire_and_restored() {
        let (server_stream, client_stream) = tcp_pair().await;

        let client_sink: Arc<dyn MailSink> = Arc::new(LogSink);
        let client_transport =
            Transport::new(client_stream, "clt.example", client_sink.clone()).unwrap();
        let (client_worker, client_handle) =
            SessionWorker::new(Role::Client, "alice", client_transport, client_sink);
        tokio::spawn(client_worker.run());

        let mut mail = plain_mail();
        mail.encrypted = true;
        mail.body = "abc xyz".to_string();
        client_handle.submit(SessionTask::SendMail {
            mail,
            envelope: None,
        });

        // hand-rolled receiving side so the raw wire lines are observable
        let mut srv = Transport::new(server_stream, "srv.example", Arc::new(LogSink)).unwrap();

        let from = srv.read_line().await.unwrap();
        assert_eq!(from, "MAIL FROM:<alice@srv>");
        srv.send_line(&codec::ok_reply()).await.unwrap();

        let rcpt = srv.read_line().await.unwrap();
        assert_eq!(rcpt, "RCPT TO:<bob@srv>");
        srv.send_line(&codec::ok_reply()).await.unwrap();

        assert_eq!(srv.read_line().await.unwrap(), "DATA");
        srv.send_line(&codec::end_data_with()).await.unwrap();

        assert_eq!(srv.read_line().await.unwrap(), codec::ENCRYPTED_MARKER);

        let mut wire_lines = Vec::new();
        loop {
            let line = srv.read_line().await.unwrap();
            if line == codec::DATA_TERMINATOR {
                break;
            }
            wire_lines.push(line);
        }
        srv.send_line(&codec::ok_reply()).await.unwrap();

        // shift 13 turns "abc xyz" into "nop klm" on the wire
        assert_eq!(wire_lines.last().unwrap(), "nop klm");

        let restored = codec::caesar_shift(&wire_lines, 26 - codec::SHIFT_AMOUNT);
        assert_eq!(restored.last().unwrap(), "abc xyz");
    }

    #[tokio::test]
    async fn test_unknown_command_gets_500() {
        let (server_stream, client_stream) = tcp_pair().await;
        let sink = CollectSink::new();

        let server_sink: Arc<dyn MailSink> = sink.clone();
        let server_transport =
            Transport::new(server_stream, "srv.example", server_sink.clone()).unwrap();
        let (server_worker, _handle) =
            SessionWorker::new(Role::Server, "alice", server_transport, server_sink);
        tokio::spawn(server_worker.run());

        let mut clt = Transport::new(client_stream, "clt.example", Arc::new(LogSink)).unwrap();
        clt.send_line("BOGUS COMMAND").await.unwrap();
        assert_eq!(
            clt.read_line().await.unwrap(),
            "500 Syntax error, command unrecognized"
        );
    }

    #[tokio::test]
    async fn test_quit_ends_session_and_reports_departure() {
        let (server_stream, client_stream) = tcp_pair().await;
        let sink = CollectSink::new();

        let server_sink: Arc<dyn MailSink> = sink.clone();
        let server_transport =
            Transport::new(server_stream, "srv.example", server_sink.clone()).unwrap();
        let (server_worker, handle) =
            SessionWorker::new(Role::Server, "alice", server_transport, server_sink);
        let join = tokio::spawn(server_worker.run());

        let mut clt = Transport::new(client_stream, "clt.example", Arc::new(LogSink)).unwrap();
        clt.send_line("quit").await.unwrap();
        assert_eq!(
            clt.read_line().await.unwrap(),
            "221 srv.example Service closing transmission channel"
        );

        join.await.unwrap();
        assert!(!handle.is_connected());
        assert_eq!(*sink.departed.lock().unwrap(), vec!["alice".to_string()]);
    }
}
