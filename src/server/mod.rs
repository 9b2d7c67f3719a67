pub mod auth;
pub mod config;
pub mod dispatch;
pub mod listener;
pub mod maillog;
pub mod queue;

pub use auth::AuthStore;
pub use config::ServerConfig;
pub use dispatch::{Dispatcher, LocalHosts};
pub use listener::{new_session_map, Listener, SessionMap};
pub use queue::{QueueHandle, QueueProcessor};

use crate::common::message::SmtpMailMessage;
use crate::common::sink::{MailSink, Severity};
use crate::server::config::user_data_path;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Sink wiring the protocol engine to the dispatcher and session map
pub struct ServerSink {
    dispatcher: Dispatcher,
    sessions: SessionMap,
}

impl ServerSink {
    pub fn new(dispatcher: Dispatcher, sessions: SessionMap) -> Self {
        Self {
            dispatcher,
            sessions,
        }
    }
}

impl MailSink for ServerSink {
    fn show_dialog(&self, text: &str, title: &str, severity: Severity) {
        crate::log_info!("[{}] {}: {}", severity, title, text);
    }

    fn on_mail_received(&self, mail: SmtpMailMessage) {
        if mail.smtp_recipients.is_empty() {
            crate::log_error!(
                "Dropping message from {} with no envelope recipients",
                mail.smtp_from
            );
            return;
        }
        self.dispatcher.dispatch(mail);
    }

    fn on_user_disconnect(&self, username: &str) {
        let mut sessions = self.sessions.write().unwrap();

        // a re-login may already have replaced this slot with a live session
        let departed = sessions
            .get(username)
            .map(|handle| !handle.is_connected())
            .unwrap_or(false);

        if departed {
            sessions.remove(username);
            crate::log_info!("{} has disconnected", username);
        }
    }
}

/// A running server: listener, queue processor, and auth store
pub struct Server {
    addr: SocketAddr,
    storage: PathBuf,
    auth: Arc<AuthStore>,
    sessions: SessionMap,
    shutdown: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    queue_task: JoinHandle<()>,
}

impl Server {
    /// Brings up the full engine per the given config
    pub async fn start(config: ServerConfig, storage: PathBuf) -> Result<Self, String> {
        let auth = Arc::new(AuthStore::new()?);
        if let Err(err) = auth.load(&user_data_path(&storage)).await {
            crate::log_error!("{}", err);
        }

        let sessions = new_session_map();
        let local_hosts = Arc::new(LocalHosts::new(&config.hostname, &config.aliases));

        crate::log_info!("This server can receive mail on:");
        for host in local_hosts.iter() {
            crate::log_info!("  {}", host);
        }

        let (shutdown, running) = watch::channel(true);

        let (processor, queue_handle) = QueueProcessor::new(
            &config,
            storage.clone(),
            sessions.clone(),
            local_hosts.clone(),
            running.clone(),
        );
        let dispatcher = Dispatcher::new(queue_handle, local_hosts);
        let sink: Arc<dyn MailSink> = Arc::new(ServerSink::new(dispatcher, sessions.clone()));

        let queue_task = tokio::spawn(processor.run());

        let listener = Listener::bind(
            config.port,
            config.hostname.clone(),
            config.security,
            auth.clone(),
            sessions.clone(),
            sink,
            running,
        )
        .await?;
        let addr = listener.local_addr()?;
        let listener_task = tokio::spawn(listener.run());

        Ok(Self {
            addr,
            storage,
            auth,
            sessions,
            shutdown,
            listener_task,
            queue_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn auth(&self) -> &Arc<AuthStore> {
        &self.auth
    }

    /// Live sessions keyed by username
    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    /// Graceful stop: sessions are asked to quit, queues dumped, users saved
    pub async fn shutdown(self) -> Result<(), String> {
        let _ = self.shutdown.send(false);
        let _ = self.listener_task.await;
        let _ = self.queue_task.await;
        self.auth.save(&user_data_path(&self.storage)).await
    }
}
