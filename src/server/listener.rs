use crate::common::codec;
use crate::common::session::{self, Role, SessionHandle, SessionTask, SessionWorker};
use crate::common::sink::MailSink;
use crate::common::transport::Transport;
use crate::server::auth::AuthStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Connected users, key is logged-in username, value is that user's session
///
/// Insertions happen on connection tasks; the queue processor and the
/// departure callback read and must tolerate absence.
pub type SessionMap = Arc<RwLock<HashMap<String, SessionHandle>>>;

pub fn new_session_map() -> SessionMap {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Accept loop: handshake, LOGIN, then one session worker per connection
pub struct Listener {
    listener: TcpListener,
    hostname: String,
    security: bool,
    auth: Arc<AuthStore>,
    sessions: SessionMap,
    sink: Arc<dyn MailSink>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub async fn bind(
        port: u16,
        hostname: String,
        security: bool,
        auth: Arc<AuthStore>,
        sessions: SessionMap,
        sink: Arc<dyn MailSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, String> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| format!("Unable to bind to socket on {}: {}", port, e))?;

        Ok(Self {
            listener,
            hostname,
            security,
            auth,
            sessions,
            sink,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, String> {
        self.listener
            .local_addr()
            .map_err(|e| format!("Unable to read listener address: {}", e))
    }

    pub async fn run(mut self) {
        match self.local_addr() {
            Ok(addr) => crate::log_info!("Server awaiting connections on {}", addr),
            Err(err) => crate::log_error!("{}", err),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            crate::log_info!("Client attempting to authenticate from: {}", addr);
                            tokio::spawn(handle_connection(
                                stream,
                                self.hostname.clone(),
                                self.security,
                                self.auth.clone(),
                                self.sessions.clone(),
                                self.sink.clone(),
                            ));
                        }
                        Err(err) => {
                            crate::log_error!("Connection blocked: {}", err);
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || !*self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_sessions();
    }

    /// Asks every live session to quit and clears the map
    fn stop_sessions(&self) {
        crate::log_info!("Stopping server...");

        let mut sessions = self.sessions.write().unwrap();
        for handle in sessions.values() {
            if !handle.submit(SessionTask::Disconnect) {
                handle.halt();
            }
        }
        sessions.clear();
    }
}

/// Runs handshake and LOGIN for one accepted socket, then the session loop
async fn handle_connection(
    stream: TcpStream,
    hostname: String,
    security: bool,
    auth: Arc<AuthStore>,
    sessions: SessionMap,
    sink: Arc<dyn MailSink>,
) {
    let mut transport = match Transport::new(stream, hostname, sink.clone()) {
        Ok(transport) => transport,
        Err(err) => {
            crate::log_error!("Error initializing connection with remote: {}", err);
            return;
        }
    };

    if let Err(err) = session::server_handshake(&mut transport, &*sink).await {
        crate::log_error!("Error initializing connection with remote: {}", err);
        return;
    }

    let (username, password) = match session::read_login(&mut transport, &*sink).await {
        Ok(pair) => pair,
        Err(err) => {
            crate::log_error!("Error reading login from remote: {}", err);
            return;
        }
    };

    let peer = transport.peer_ip().to_string();

    // authenticate only if security is enabled, else let everyone be whoever
    if security && !auth.is_valid_login(&username, &password) {
        let _ = transport.send_line(codec::LOGIN_DECLINED).await;
        transport.close().await;
        crate::log_info!("{} failed to authenticate as {}", peer, username);
        return;
    }

    if transport.send_line(codec::LOGIN_ACCEPTED).await.is_err() {
        return;
    }
    crate::log_info!("{} authenticated as {}", peer, username);

    let (worker, handle) = SessionWorker::new(Role::Server, &username, transport, sink);

    // a re-login evicts the prior session for this username; its loop is
    // told to quit so dangling tasks submitted to it cannot write
    let prior = sessions.write().unwrap().insert(username.clone(), handle);
    if let Some(old) = prior {
        crate::log_info!("Evicting prior session for {}", username);
        if !old.submit(SessionTask::Disconnect) {
            old.halt();
        }
    }

    worker.run().await;
}
