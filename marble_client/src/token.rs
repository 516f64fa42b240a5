//! Durable session-token storage.
//!
//! The server issues a session token in `welcome`; presenting it in the
//! next `join` resumes the same server-side seat across reconnects and
//! process restarts. One token, one fixed path, plain text. Storage
//! failures are logged and otherwise ignored: losing the token costs a
//! resume, not the session.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

const APP_DIR: &str = "marble-client";
const TOKEN_FILE: &str = "session-token";

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store under the platform data directory
    /// (`<data_dir>/marble-client/session-token`), falling back to the
    /// working directory when the platform reports none.
    pub fn open_default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join(APP_DIR).join(TOKEN_FILE),
        }
    }

    /// Store at an explicit path (tests, `--token-file`).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted token, if any.
    pub fn load(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read session token");
                None
            }
        }
    }

    /// Persists a fresh token, replacing any previous one.
    pub fn save(&self, token: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "failed to create token dir");
                return;
            }
        }
        if let Err(e) = fs::write(&self.path, token) {
            warn!(path = %self.path.display(), error = %e, "failed to persist session token");
        }
    }

    /// Forgets the persisted token.
    pub fn clear(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to clear session token");
            }
        }
    }
}
