//! Persisted operator session.
//!
//! Holds the API tokens and profile fields between runs. There is no expiry
//! bookkeeping: the API client refreshes on 401 and clears nothing on its
//! own, so a stale session only costs one refresh round-trip.

use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
}

impl Session {
    /// Load from file. Missing or unreadable files give an empty session.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to parse session file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                error!("Failed to read session file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

/// Session with auto-save. Shared by the API client and the CLI.
pub struct SessionStore {
    path: Option<PathBuf>,
    state: RwLock<Session>,
}

impl SessionStore {
    /// File-backed store at `path`.
    pub fn open(path: PathBuf) -> Self {
        let state = Session::load(&path);
        Self {
            path: Some(path),
            state: RwLock::new(state),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory(session: Session) -> Self {
        Self {
            path: None,
            state: RwLock::new(session),
        }
    }

    pub fn get(&self) -> Session {
        self.state.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.read().refresh_token.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().access_token.is_some()
    }

    /// Apply `f` and persist the result.
    pub fn update(&self, f: impl FnOnce(&mut Session)) {
        let mut state = self.state.write();
        f(&mut state);
        self.persist(&state);
    }

    /// Forget everything (logout).
    pub fn clear(&self) {
        self.update(|s| *s = Session::default());
        info!("Session cleared");
    }

    fn persist(&self, session: &Session) {
        if let Some(path) = &self.path
            && let Err(e) = session.save(path)
        {
            error!("Failed to save session: {}", e);
        }
    }
}
