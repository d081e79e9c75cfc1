//! File-based session index.
//!
//! Directory structure:
//! ```text
//! {session_home}/
//!   {digits}.session     # one file per phone number
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use super::error::{StorageError, StorageResult};
use super::session::SessionStore;

pub const SESSION_FILE_EXTENSION: &str = "session";

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    session_home: PathBuf,
}

impl FileSessionStore {
    pub fn new(session_home: impl Into<PathBuf>) -> Self {
        Self {
            session_home: session_home.into(),
        }
    }

    pub fn session_home(&self) -> &Path {
        &self.session_home
    }

    /// Path of the session file for `phone`.
    ///
    /// Formatting is ignored: `+1 (555) 010-0000` and `15550100000` share a file.
    pub fn session_path(&self, phone: &str) -> PathBuf {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        self.session_home
            .join(format!("{digits}.{SESSION_FILE_EXTENSION}"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn exists(&self, phone: &str) -> bool {
        let path = self.session_path(phone);
        match fs::metadata(&path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat session file, assuming present");
                true
            }
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut phones = Vec::new();

        let mut entries = match fs::read_dir(&self.session_home).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::file_io(&self.session_home, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&self.session_home, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == SESSION_FILE_EXTENSION)
                && let Some(stem) = path.file_stem()
            {
                phones.push(stem.to_string_lossy().to_string());
            }
        }

        phones.sort();
        Ok(phones)
    }
}
