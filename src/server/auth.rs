use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tokio::fs;

/// Length of the password salt
const SALT_LENGTH: usize = 16;

/// A managed user record
#[derive(Debug, Clone)]
struct User {
    salt: Vec<u8>,
    pass_hash: String,
}

/// Manages user login information
///
/// Passwords are stored as hex SHA-1(salt || password). That is not a scheme
/// to copy into anything security-sensitive, but it is what the wire protocol
/// family pins. Readers may race the add-user path; last write wins.
pub struct AuthStore {
    users: RwLock<HashMap<String, User>>,
}

impl AuthStore {
    /// Creates the store, probing the secure random source once
    ///
    /// A missing entropy source is a fatal startup condition.
    pub fn new() -> Result<Self, String> {
        let mut probe = [0u8; SALT_LENGTH];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| format!("Secure random source unavailable: {}", e))?;

        Ok(Self {
            users: RwLock::new(HashMap::new()),
        })
    }

    /// Adds (or replaces) a user with a fresh random salt
    pub fn add_user(&self, username: &str, plaintext: &str) -> Result<(), String> {
        let mut salt = vec![0u8; SALT_LENGTH];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|e| format!("Secure random source unavailable: {}", e))?;

        let pass_hash = hashed_password(plaintext, &salt);
        self.users
            .write()
            .unwrap()
            .insert(username.to_string(), User { salt, pass_hash });
        Ok(())
    }

    /// Validates a user login; unknown users are simply invalid
    pub fn is_valid_login(&self, username: &str, plaintext: &str) -> bool {
        let users = self.users.read().unwrap();
        let user = match users.get(username) {
            Some(user) => user,
            None => return false,
        };

        let candidate = hashed_password(plaintext, &user.salt);
        constant_time_eq(candidate.as_bytes(), user.pass_hash.as_bytes())
    }

    pub fn user_count(&self) -> usize {
        self.users.read().unwrap().len()
    }

    /// Attempts to load saved records; absent file is not an error
    pub async fn load(&self, path: &Path) -> Result<usize, String> {
        if !path.exists() {
            crate::verbose!("No saved user data at {:?}", path);
            return Ok(0);
        }

        let bytes = fs::read(path)
            .await
            .map_err(|e| format!("Error reading saved user data: {}", e))?;

        let mut users = self.users.write().unwrap();
        let mut pos = 0;
        let mut loaded = 0;
        while pos < bytes.len() {
            let username = read_utf(&bytes, &mut pos)?;
            let pass_hash = read_utf(&bytes, &mut pos)?;
            let salt_len = read_u32(&bytes, &mut pos)? as usize;
            let salt = take(&bytes, &mut pos, salt_len)?.to_vec();

            crate::log_info!("Loaded saved user: {}", username);
            users.insert(username, User { salt, pass_hash });
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Writes all records; an empty store saves nothing
    pub async fn save(&self, path: &Path) -> Result<(), String> {
        let mut bytes = Vec::new();
        {
            let users = self.users.read().unwrap();
            if users.is_empty() {
                return Ok(());
            }

            for (username, user) in users.iter() {
                write_utf(&mut bytes, username)?;
                write_utf(&mut bytes, &user.pass_hash)?;
                bytes.extend_from_slice(&(user.salt.len() as u32).to_be_bytes());
                bytes.extend_from_slice(&user.salt);
            }
        }

        fs::write(path, bytes)
            .await
            .map_err(|e| format!("Error writing saved user data: {}", e))
    }
}

/// Hex SHA-1 of salt || plaintext
fn hashed_password(plaintext: &str, salt: &[u8]) -> String {
    let mut digest = Sha1::new();
    digest.update(salt);
    digest.update(plaintext.as_bytes());

    let mut hex = String::new();
    for byte in digest.finalize() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Length-independent-timing equality for same-length inputs
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], String> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| "Truncated user data record".to_string())?;
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Reads a 2-byte big-endian length-prefixed UTF-8 string
fn read_utf(bytes: &[u8], pos: &mut usize) -> Result<String, String> {
    let len_bytes = take(bytes, pos, 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let raw = take(bytes, pos, len)?;
    String::from_utf8(raw.to_vec()).map_err(|e| format!("Invalid UTF-8 in user data: {}", e))
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, String> {
    let raw = take(bytes, pos, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn write_utf(out: &mut Vec<u8>, value: &str) -> Result<(), String> {
    let len = u16::try_from(value.len())
        .map_err(|_| format!("String too long for user data record: {} bytes", value.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_file(tag: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "relay-mail-auth-{}-{}-{}.bin",
            tag,
            std::process::id(),
            n
        ))
    }

    #[test]
    fn test_add_and_validate() {
        let store = AuthStore::new().unwrap();
        store.add_user("alice", "hunter2").unwrap();

        assert!(store.is_valid_login("alice", "hunter2"));
        assert!(!store.is_valid_login("alice", "wrong"));
        assert!(!store.is_valid_login("nobody", "hunter2"));
    }

    #[test]
    fn test_salts_differ_between_users() {
        let store = AuthStore::new().unwrap();
        store.add_user("alice", "same-pass").unwrap();
        store.add_user("bob", "same-pass").unwrap();

        let users = store.users.read().unwrap();
        let alice = &users["alice"];
        let bob = &users["bob"];
        assert_ne!(alice.salt, bob.salt);
        assert_ne!(alice.pass_hash, bob.pass_hash);
        assert_eq!(alice.pass_hash.len(), 40);
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let path = temp_file("round-trip");

        let store = AuthStore::new().unwrap();
        store.add_user("alice", "hunter2").unwrap();
        store.add_user("bob", "letmein").unwrap();
        store.save(&path).await.unwrap();

        let restored = AuthStore::new().unwrap();
        assert_eq!(restored.load(&path).await.unwrap(), 2);
        assert!(restored.is_valid_login("alice", "hunter2"));
        assert!(restored.is_valid_login("bob", "letmein"));
        assert!(!restored.is_valid_login("alice", "letmein"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_empty_store_saves_nothing() {
        let path = temp_file("empty");

        let store = AuthStore::new().unwrap();
        store.save(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_truncated_file_is_an_error() {
        let path = temp_file("truncated");
        std::fs::write(&path, [0x00, 0x05, b'a']).unwrap();

        let store = AuthStore::new().unwrap();
        assert!(store.load(&path).await.is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_file_loads_zero() {
        let store = AuthStore::new().unwrap();
        let loaded = store
            .load(Path::new("/nonexistent/user-data.bin"))
            .await
            .unwrap();
        assert_eq!(loaded, 0);
    }
}
