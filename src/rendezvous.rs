//! Rendezvous file discovery and authentication material.
//!
//! The server deposits `info.txt` in a well-known per-user directory: line 1
//! is the TCP port in decimal, line 2 the 16-byte shared secret as
//! space-separated hex tokens. A sibling `info.txt.trigger` file is created
//! and immediately removed so watchers learn the info file is readable.
//! Cleanup is best-effort: a guard removes the files when the worker stops;
//! if the process dies first the stale file is overwritten by the next
//! server.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

pub const SECRET_LEN: usize = 16;
pub const INFO_FILE: &str = "info.txt";
const TRIGGER_SUFFIX: &str = ".trigger";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RendezvousError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous file missing: {path}")]
    Missing { path: PathBuf },
    #[error("rendezvous file malformed: {reason}")]
    Malformed { reason: String },
    #[error("secret generation failed: {0}")]
    Entropy(String),
}

/// Contents of the info file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousInfo {
    pub port: u16,
    pub secret: [u8; SECRET_LEN],
}

/// Generate a fresh handshake secret from the OS entropy source.
pub fn generate_secret() -> Result<[u8; SECRET_LEN], RendezvousError> {
    let mut secret = [0u8; SECRET_LEN];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|e| RendezvousError::Entropy(e.to_string()))?;
    Ok(secret)
}

fn info_path(dir: &Path) -> PathBuf {
    dir.join(INFO_FILE)
}

fn trigger_path(dir: &Path) -> PathBuf {
    dir.join(format!("{INFO_FILE}{TRIGGER_SUFFIX}"))
}

/// Write the info file atomically (temp file + rename), then create and
/// remove the trigger file to signal readiness. The returned guard removes
/// the info file on drop.
pub fn publish(dir: &Path, info: &RendezvousInfo) -> Result<RendezvousGuard, RendezvousError> {
    fs::create_dir_all(dir)?;

    let mut contents = format!("{}\n", info.port);
    let tokens: Vec<String> = info.secret.iter().map(|b| format!("0x{b:02x}")).collect();
    contents.push_str(&tokens.join(" "));
    contents.push('\n');

    let path = info_path(dir);
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.persist(&path).map_err(|e| e.error)?;

    let trigger = trigger_path(dir);
    drop(fs::File::create(&trigger)?);
    let _ = fs::remove_file(&trigger);

    Ok(RendezvousGuard {
        info_path: path,
        trigger_path: trigger,
    })
}

/// Removes the rendezvous files when the owning worker stops.
#[derive(Debug)]
pub struct RendezvousGuard {
    info_path: PathBuf,
    trigger_path: PathBuf,
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.info_path);
        let _ = fs::remove_file(&self.trigger_path);
    }
}

/// Read and parse the info file. Hex tokens may be written `0xNN` or `NN`.
pub fn read_info(dir: &Path) -> Result<RendezvousInfo, RendezvousError> {
    let path = info_path(dir);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RendezvousError::Missing { path });
        }
        Err(e) => return Err(e.into()),
    };

    let malformed = |reason: String| RendezvousError::Malformed { reason };
    let mut lines = contents.lines();
    let port_line = lines
        .next()
        .ok_or_else(|| malformed("missing port line".to_string()))?;
    let port: u16 = port_line
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid port {port_line:?}")))?;

    let secret_line = lines
        .next()
        .ok_or_else(|| malformed("missing secret line".to_string()))?;
    let tokens: Vec<&str> = secret_line.split_whitespace().collect();
    if tokens.len() != SECRET_LEN {
        return Err(malformed(format!(
            "expected {SECRET_LEN} secret tokens, got {}",
            tokens.len()
        )));
    }
    let mut secret = [0u8; SECRET_LEN];
    for (slot, token) in secret.iter_mut().zip(&tokens) {
        let hex = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        *slot = u8::from_str_radix(hex, 16)
            .map_err(|_| malformed(format!("invalid secret token {token:?}")))?;
    }

    Ok(RendezvousInfo { port, secret })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn publish_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let info = RendezvousInfo {
            port: 43210,
            secret: *b"0123456789abcdef",
        };
        let guard = publish(dir.path(), &info).unwrap();
        assert!(dir.path().join(INFO_FILE).exists());
        // Trigger file was created and already removed.
        assert!(!trigger_path(dir.path()).exists());

        let read = read_info(dir.path()).unwrap();
        assert_eq!(read, info);

        drop(guard);
        assert!(!dir.path().join(INFO_FILE).exists());
    }

    #[test]
    fn bare_hex_tokens_are_accepted() {
        let dir = TempDir::new().unwrap();
        let tokens: Vec<String> = (0u8..16).map(|b| format!("{b:02X}")).collect();
        fs::write(
            info_path(dir.path()),
            format!("1234\n{}\n", tokens.join(" ")),
        )
        .unwrap();

        let read = read_info(dir.path()).unwrap();
        assert_eq!(read.port, 1234);
        assert_eq!(read.secret[..], (0u8..16).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn missing_file_is_distinguished() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_info(dir.path()),
            Err(RendezvousError::Missing { .. })
        ));
    }

    #[test]
    fn malformed_contents_are_rejected() {
        let dir = TempDir::new().unwrap();
        for contents in [
            "",
            "not-a-port\n0x00\n",
            "1234\n",
            "1234\n0x00 0x01\n",
            "1234\nzz zz zz zz zz zz zz zz zz zz zz zz zz zz zz zz\n",
        ] {
            fs::write(info_path(dir.path()), contents).unwrap();
            assert!(
                matches!(read_info(dir.path()), Err(RendezvousError::Malformed { .. })),
                "accepted {contents:?}"
            );
        }
    }

    #[test]
    fn generated_secrets_differ() {
        let a = generate_secret().unwrap();
        let b = generate_secret().unwrap();
        assert_ne!(a, b);
    }
}
