pub mod codec;
pub mod message;
pub mod session;
pub mod sink;
pub mod transport;

pub use message::{MailMessage, SmtpMailMessage};
pub use session::{Role, SessionHandle, SessionTask, SessionWorker};
pub use sink::{MailSink, Severity};
pub use transport::Transport;
