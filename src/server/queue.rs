use crate::common::message::{MailMessage, SmtpMailMessage};
use crate::common::session::{self, Role, SessionTask, SessionWorker};
use crate::common::sink::{LogSink, MailSink};
use crate::common::transport::Transport;
use crate::server::config::ServerConfig;
use crate::server::dispatch::{split_address, LocalHosts};
use crate::server::listener::SessionMap;
use crate::server::maillog;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Most entries a single tick may drain from each queue
const DRAIN_LIMIT: usize = 10;

/// Pause between processing ticks
const TICK: Duration = Duration::from_millis(250);

/// Grace period letting a relay session flush before it is asked to quit
const RELAY_GRACE: Duration = Duration::from_millis(500);

/// Queue persistence format version
const QUEUE_FILE_VERSION: u32 = 1;

/// Queue-insertion work submitted from session tasks
///
/// Insertions travel through one inbox so they land in submission order.
pub enum QueueTask {
    /// A message for a user on this server, keyed by bare username
    SubmitIncoming(String, MailMessage),
    /// A message to be relayed to other servers
    SubmitOutgoing(SmtpMailMessage),
}

/// Thread-safe handle feeding the queue processor's inbox
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueTask>,
}

impl QueueHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<QueueTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Submits a message to be delivered to a user on this server
    pub fn submit_incoming(&self, username: String, mail: MailMessage) {
        let _ = self.tx.send(QueueTask::SubmitIncoming(username, mail));
    }

    /// Submits a message to be relayed to another server
    pub fn submit_outgoing(&self, msg: SmtpMailMessage) {
        let _ = self.tx.send(QueueTask::SubmitOutgoing(msg));
    }
}

/// Persisted form of one local-delivery entry
#[derive(Serialize, Deserialize)]
struct IncomingEntry {
    username: String,
    mail: MailMessage,
}

/// On-disk wrapper for a drained queue
#[derive(Serialize, Deserialize)]
struct QueueFile<T> {
    version: u32,
    entries: Vec<T>,
}

/// Processes the local-delivery and outbound-relay queues
///
/// One cooperative loop: drain the inbox, pop a bounded batch off each queue,
/// sleep. Local delivery retries forever; outbound delivery is best-effort.
pub struct QueueProcessor {
    inbox: mpsc::UnboundedReceiver<QueueTask>,
    incoming: VecDeque<(String, MailMessage)>,
    outgoing: VecDeque<SmtpMailMessage>,
    sessions: SessionMap,
    local_hosts: Arc<LocalHosts>,
    storage: PathBuf,
    hostname: String,
    relay_username: String,
    relay_password: String,
    relay_port: u16,
    running: watch::Receiver<bool>,
}

impl QueueProcessor {
    pub fn new(
        config: &ServerConfig,
        storage: PathBuf,
        sessions: SessionMap,
        local_hosts: Arc<LocalHosts>,
        running: watch::Receiver<bool>,
    ) -> (Self, QueueHandle) {
        let (handle, inbox) = QueueHandle::channel();

        let processor = Self {
            inbox,
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            sessions,
            local_hosts,
            storage,
            hostname: config.hostname.clone(),
            relay_username: config.relay_username.clone(),
            relay_password: config.relay_password.clone(),
            relay_port: config.relay_port,
            running,
        };

        (processor, handle)
    }

    pub async fn run(mut self) {
        self.restore().await;

        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                changed = self.running.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if !*self.running.borrow() {
                break;
            }
        }

        self.persist().await;
    }

    async fn tick(&mut self) {
        self.drain_inbox();
        self.process_incoming().await;
        self.process_outgoing().await;
    }

    fn drain_inbox(&mut self) {
        while let Ok(task) = self.inbox.try_recv() {
            match task {
                QueueTask::SubmitIncoming(username, mail) => {
                    self.incoming.push_back((username, mail));
                }
                QueueTask::SubmitOutgoing(msg) => self.outgoing.push_back(msg),
            }
        }
    }

    /// Local deliveries: at-least-once, entries wait at the tail until a
    /// session for their user exists
    async fn process_incoming(&mut self) {
        let batch = self.incoming.len().min(DRAIN_LIMIT);

        for _ in 0..batch {
            let (username, mail) = match self.incoming.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            let handle = self.sessions.read().unwrap().get(&username).cloned();
            let delivered = match handle {
                Some(session) => session.submit(SessionTask::SendMail {
                    mail: mail.clone(),
                    envelope: None,
                }),
                None => false,
            };

            if delivered {
                if let Err(err) = maillog::write_message_log(
                    &self.storage,
                    maillog::LOCAL_SERVER_DIR,
                    &username,
                    &mail,
                )
                .await
                {
                    crate::log_error!("Error logging message from {}: {}", mail.sender, err);
                }
            } else {
                self.incoming.push_back((username, mail));
            }
        }
    }

    /// Outbound relays: one fresh connection per remote recipient, dropped
    /// (with a log line) on connect or login failure
    async fn process_outgoing(&mut self) {
        let batch = self.outgoing.len().min(DRAIN_LIMIT);

        for _ in 0..batch {
            let msg = match self.outgoing.pop_front() {
                Some(msg) => msg,
                None => break,
            };

            for recipient in &msg.smtp_recipients {
                if recipient.is_empty() {
                    continue;
                }

                let (user, host) = match split_address(recipient) {
                    Some(parts) => parts,
                    None => {
                        crate::log_error!("Malformed data in outgoing queue: {}", recipient);
                        continue;
                    }
                };

                // local copies were queued separately by the dispatcher
                if self.local_hosts.contains(host) {
                    continue;
                }

                match self.relay_to_remote(host, recipient, &msg).await {
                    Ok(()) => {
                        if let Err(err) =
                            maillog::write_message_log(&self.storage, host, user, &msg.mail).await
                        {
                            crate::log_error!(
                                "Error logging message from {}: {}",
                                msg.mail.sender,
                                err
                            );
                        }
                    }
                    Err(err) => {
                        crate::log_error!("Unable to relay message for {}: {}", recipient, err);
                    }
                }
            }
        }
    }

    /// Opens a throwaway client-role session to the recipient's server
    async fn relay_to_remote(
        &self,
        host: &str,
        recipient: &str,
        msg: &SmtpMailMessage,
    ) -> Result<(), String> {
        crate::verbose!("Relaying to {} on {}:{}", recipient, host, self.relay_port);

        let stream = TcpStream::connect((host, self.relay_port))
            .await
            .map_err(|e| format!("connect to {}:{} failed: {}", host, self.relay_port, e))?;

        let sink: Arc<dyn MailSink> = Arc::new(LogSink);
        let mut transport = Transport::new(stream, self.hostname.clone(), sink.clone())?;

        session::client_handshake(&mut transport, &*sink).await?;
        let accepted = session::client_login(
            &mut transport,
            &*sink,
            &self.relay_username,
            &self.relay_password,
        )
        .await?;
        if !accepted {
            transport.close().await;
            return Err(format!("relay login declined by {}", host));
        }

        let (worker, handle) =
            SessionWorker::new(Role::Client, &self.relay_username, transport, sink);
        tokio::spawn(worker.run());

        handle.submit(SessionTask::SendMail {
            mail: msg.mail.clone(),
            envelope: Some(vec![recipient.to_string()]),
        });

        tokio::time::sleep(RELAY_GRACE).await;
        handle.submit(SessionTask::Disconnect);

        Ok(())
    }

    fn incoming_path(&self) -> PathBuf {
        self.storage.join("incoming-queue.json")
    }

    fn outgoing_path(&self) -> PathBuf {
        self.storage.join("outgoing-queue.json")
    }

    /// Re-enqueues anything a previous run left behind
    async fn restore(&mut self) {
        for entry in load_queue::<IncomingEntry>(&self.incoming_path()).await {
            self.incoming.push_back((entry.username, entry.mail));
        }
        for msg in load_queue::<SmtpMailMessage>(&self.outgoing_path()).await {
            self.outgoing.push_back(msg);
        }

        if !self.incoming.is_empty() || !self.outgoing.is_empty() {
            crate::log_info!(
                "Restored {} incoming and {} outgoing queued messages",
                self.incoming.len(),
                self.outgoing.len()
            );
        }
    }

    /// Best-effort dump of whatever is still queued
    async fn persist(&mut self) {
        // anything still in flight in the inbox belongs on disk too
        self.drain_inbox();

        let incoming: Vec<IncomingEntry> = self
            .incoming
            .drain(..)
            .map(|(username, mail)| IncomingEntry { username, mail })
            .collect();
        if let Err(err) = save_queue(&self.incoming_path(), incoming).await {
            crate::log_error!("Failed to persist incoming queue: {}", err);
        }

        let outgoing: Vec<SmtpMailMessage> = self.outgoing.drain(..).collect();
        if let Err(err) = save_queue(&self.outgoing_path(), outgoing).await {
            crate::log_error!("Failed to persist outgoing queue: {}", err);
        }
    }
}

/// Reads a persisted queue; corruption logs and yields an empty queue
async fn load_queue<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    if !path.exists() {
        return Vec::new();
    }

    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(err) => {
            crate::log_error!("Failed to read queue file {:?}: {}", path, err);
            return Vec::new();
        }
    };

    match serde_json::from_str::<QueueFile<T>>(&json) {
        Ok(file) if file.version == QUEUE_FILE_VERSION => file.entries,
        Ok(file) => {
            crate::log_error!(
                "Unsupported queue file version {} in {:?}",
                file.version,
                path
            );
            Vec::new()
        }
        Err(err) => {
            crate::log_error!("Corrupt queue file {:?}: {}", path, err);
            Vec::new()
        }
    }
}

/// Writes a queue dump; an empty queue removes any stale file instead
async fn save_queue<T: Serialize>(path: &Path, entries: Vec<T>) -> Result<(), String> {
    if entries.is_empty() {
        if path.exists() {
            let _ = fs::remove_file(path).await;
        }
        return Ok(());
    }

    let file = QueueFile {
        version: QUEUE_FILE_VERSION,
        entries,
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| format!("Failed to serialize queue: {}", e))?;

    fs::write(path, json)
        .await
        .map_err(|e| format!("Failed to write {:?}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::listener::new_session_map;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_storage(tag: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "relay-mail-queue-{}-{}-{}",
            tag,
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn processor(storage: PathBuf) -> (QueueProcessor, QueueHandle) {
        let config = ServerConfig {
            hostname: "srv.example".to_string(),
            ..ServerConfig::default()
        };
        // tests drive tick() directly, so the shutdown sender can drop
        let (_tx, running) = watch::channel(true);
        QueueProcessor::new(
            &config,
            storage,
            new_session_map(),
            Arc::new(LocalHosts::new("srv.example", &[])),
            running,
        )
    }

    fn mail_for(user: &str) -> MailMessage {
        let mut mail = MailMessage::default();
        mail.sender = "alice@srv.example".to_string();
        mail.to = vec![format!("{}@srv.example", user)];
        mail.subject = "hi".to_string();
        mail.body = "hello".to_string();
        mail
    }

    #[tokio::test]
    async fn test_offline_user_entry_waits_at_tail() {
        let storage = temp_storage("offline");
        let (mut processor, handle) = processor(storage.clone());

        handle.submit_incoming("carol".to_string(), mail_for("carol"));
        processor.tick().await;

        assert_eq!(processor.incoming.len(), 1);
        assert_eq!(processor.incoming[0].0, "carol");

        // the entry keeps cycling, never dropped
        processor.tick().await;
        assert_eq!(processor.incoming.len(), 1);

        let _ = std::fs::remove_dir_all(&storage);
    }

    #[tokio::test]
    async fn test_drain_is_bounded_per_tick() {
        let storage = temp_storage("bounded");
        let (mut processor, handle) = processor(storage.clone());

        for n in 0..25 {
            handle.submit_incoming(format!("user{}", n), mail_for("bob"));
        }

        processor.tick().await;
        // all 25 arrived, at most 10 were popped (and re-appended, all offline)
        assert_eq!(processor.incoming.len(), 25);
        // first tick rotated the first batch to the tail
        assert_eq!(processor.incoming[0].0, "user10");

        let _ = std::fs::remove_dir_all(&storage);
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let storage = temp_storage("persist");

        let (mut processor, handle) = processor(storage.clone());
        handle.submit_incoming("carol".to_string(), mail_for("carol"));
        handle.submit_outgoing(SmtpMailMessage {
            mail: mail_for("dave"),
            smtp_from: "alice@srv.example".to_string(),
            smtp_recipients: vec!["dave@other.example".to_string()],
        });
        processor.drain_inbox();
        processor.persist().await;

        assert!(storage.join("incoming-queue.json").exists());
        assert!(storage.join("outgoing-queue.json").exists());

        let (mut restored, _handle) = self::processor(storage.clone());
        restored.restore().await;
        assert_eq!(restored.incoming.len(), 1);
        assert_eq!(restored.incoming[0].0, "carol");
        assert_eq!(restored.outgoing.len(), 1);
        assert_eq!(
            restored.outgoing[0].smtp_recipients,
            vec!["dave@other.example"]
        );

        let _ = std::fs::remove_dir_all(&storage);
    }

    #[tokio::test]
    async fn test_empty_persist_removes_stale_files() {
        let storage = temp_storage("stale");

        let (mut processor, handle) = processor(storage.clone());
        handle.submit_incoming("carol".to_string(), mail_for("carol"));
        processor.drain_inbox();
        processor.persist().await;
        assert!(storage.join("incoming-queue.json").exists());

        let (mut drained, _handle) = self::processor(storage.clone());
        drained.restore().await;
        drained.incoming.clear();
        drained.persist().await;
        assert!(!storage.join("incoming-queue.json").exists());

        let _ = std::fs::remove_dir_all(&storage);
    }

    #[tokio::test]
    async fn test_corrupt_queue_file_starts_empty() {
        let storage = temp_storage("corrupt");
        std::fs::write(storage.join("incoming-queue.json"), "{ not json").unwrap();

        let (mut processor, _handle) = processor(storage.clone());
        processor.restore().await;
        assert!(processor.incoming.is_empty());

        let _ = std::fs::remove_dir_all(&storage);
    }

    #[tokio::test]
    async fn test_outgoing_skips_local_hosts() {
        let storage = temp_storage("skip-local");
        let (mut processor, handle) = processor(storage.clone());

        // every recipient is local, so the relay path has nothing to do
        handle.submit_outgoing(SmtpMailMessage {
            mail: mail_for("bob"),
            smtp_from: "alice@srv.example".to_string(),
            smtp_recipients: vec!["bob@srv.example".to_string(), "carol@localhost".to_string()],
        });

        processor.tick().await;
        assert!(processor.outgoing.is_empty());

        let _ = std::fs::remove_dir_all(&storage);
    }
}
