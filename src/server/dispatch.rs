use crate::common::message::SmtpMailMessage;
use crate::server::queue::QueueHandle;
use std::collections::HashSet;
use std::sync::Arc;

/// Host strings considered to belong to this server
///
/// Mail addressed to any of these stays local; everything else is relayed.
pub struct LocalHosts {
    hosts: HashSet<String>,
}

impl LocalHosts {
    pub fn new(hostname: &str, aliases: &[String]) -> Self {
        let mut hosts = HashSet::new();
        hosts.insert("localhost".to_string());
        hosts.insert("127.0.0.1".to_string());
        hosts.insert(hostname.to_string());
        hosts.extend(aliases.iter().cloned());
        Self { hosts }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }
}

/// Classifies received messages and feeds the routing queues
pub struct Dispatcher {
    local_hosts: Arc<LocalHosts>,
    queue: QueueHandle,
}

impl Dispatcher {
    pub fn new(queue: QueueHandle, local_hosts: Arc<LocalHosts>) -> Self {
        Self { local_hosts, queue }
    }

    /// Routes one received message by its envelope recipients
    ///
    /// Local recipients each get an incoming-queue entry keyed by bare
    /// username; the message goes to the outgoing queue at most once no
    /// matter how many remote recipients it names, since the outbound
    /// processor iterates recipients itself.
    pub fn dispatch(&self, msg: SmtpMailMessage) {
        let mut submitted_to_outgoing = false;

        for target in &msg.smtp_recipients {
            if target.is_empty() {
                continue;
            }

            let (user, host) = match split_address(target) {
                Some(parts) => parts,
                None => {
                    crate::log_error!("Malformed address: {}", target);
                    continue;
                }
            };

            if self.local_hosts.contains(host) {
                self.queue.submit_incoming(user.to_string(), msg.mail.clone());
            } else if !submitted_to_outgoing {
                submitted_to_outgoing = true;
                self.queue.submit_outgoing(msg.clone());
            }
        }
    }
}

/// Splits `user@host` once; None unless both parts are non-empty
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let (user, host) = address.split_once('@')?;
    if user.is_empty() || host.is_empty() {
        return None;
    }
    Some((user, host))
}
