use crate::common::message::MailMessage;
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Folder name used for deliveries to this server's own users
pub const LOCAL_SERVER_DIR: &str = "localServer";

/// Writes one accepted delivery to the file log
///
/// The file lands at `<root>/logs/<folder>/<username>/<YYYY.MM.dd-HH:mm:ss>.txt`
/// holding the message's canonical string rendering. A same-second delivery
/// for one user overwrites.
pub async fn write_message_log(
    root: &Path,
    folder: &str,
    username: &str,
    mail: &MailMessage,
) -> Result<PathBuf, String> {
    let dir = root.join("logs").join(folder).join(username);
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| format!("Failed to create log directory {:?}: {}", dir, e))?;

    let stamp = Local::now().format("%Y.%m.%d-%H:%M:%S");
    let path = dir.join(format!("{}.txt", stamp));

    fs::write(&path, mail.to_string())
        .await
        .map_err(|e| format!("Failed to write message log {:?}: {}", path, e))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_canonical_rendering() {
        let root = std::env::temp_dir().join(format!("relay-mail-log-{}", std::process::id()));

        let mut mail = MailMessage::default();
        mail.sender = "alice@srv".to_string();
        mail.to = vec!["bob@srv".to_string()];
        mail.subject = "hi".to_string();
        mail.body = "hello".to_string();

        let path = write_message_log(&root, LOCAL_SERVER_DIR, "bob", &mail)
            .await
            .unwrap();

        assert!(path.starts_with(root.join("logs").join("localServer").join("bob")));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("Encrypted: false\nFrom: alice@srv\n"));
        assert!(contents.contains("Subject: hi"));

        let _ = std::fs::remove_dir_all(&root);
    }
}
