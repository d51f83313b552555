//! Durable storage for a context's token buffer.
//!
//! Session files use a fixed little-endian layout:
//!
//! | field          | type              |
//! |----------------|-------------------|
//! | magic          | `b"LCSN"`         |
//! | version        | `u32` (1)         |
//! | capacity       | `u32`             |
//! | token count    | `u32`             |
//! | tokens         | `i32` × count     |
//! | state length   | `u32`             |
//! | engine state   | bytes             |
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never sees a half-written session.

use crate::types::TokenId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use llama_common::{ErrorCategory, LlamaError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"LCSN";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Errors raised while saving or loading a session file.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Session I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed session file: {0}")]
    Format(String),

    #[error("Session holds {count} tokens but capacity is {capacity}")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("Session path is empty")]
    EmptyPath,

    /// The file was valid but the context could not take its contents.
    #[error("Failed to load session: {0}")]
    Restore(String),
}

impl SessionError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

impl LlamaError for SessionError {
    fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotFound { .. }
            | SessionError::Format(_)
            | SessionError::CapacityExceeded { .. }
            | SessionError::EmptyPath => ErrorCategory::User,
            SessionError::Io { .. } => ErrorCategory::System,
            SessionError::Restore(_) => ErrorCategory::Engine,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotFound { .. } => "SESSION_NOT_FOUND",
            SessionError::Io { .. } => "SESSION_IO",
            SessionError::Format(_) => "SESSION_FORMAT",
            SessionError::CapacityExceeded { .. } => "SESSION_CAPACITY",
            SessionError::EmptyPath => "SESSION_EMPTY_PATH",
            SessionError::Restore(_) => "SESSION_RESTORE",
        }
    }
}

/// Token buffer plus the engine state captured alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistedSession {
    /// Context capacity declared by the writer.
    pub capacity: usize,
    pub tokens: Vec<TokenId>,
    pub engine_state: Vec<u8>,
}

impl PersistedSession {
    pub fn new(tokens: Vec<TokenId>, capacity: usize) -> Self {
        Self {
            capacity,
            tokens,
            engine_state: Vec::new(),
        }
    }

    pub fn with_engine_state(mut self, engine_state: Vec<u8>) -> Self {
        self.engine_state = engine_state;
        self
    }
}

/// Reads and writes session files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStore;

impl SessionStore {
    /// Write at most `max_count` tokens of `session` to `path`.
    ///
    /// `None`, zero, or a count larger than the buffer writes every token.
    /// Returns the number of tokens written.
    pub fn save(
        path: &Path,
        session: &PersistedSession,
        max_count: Option<usize>,
    ) -> Result<usize, SessionError> {
        if path.as_os_str().is_empty() {
            return Err(SessionError::EmptyPath);
        }

        let count = match max_count {
            Some(n) if n > 0 && n <= session.tokens.len() => n,
            _ => session.tokens.len(),
        };
        let encoded = Self::encode(session, count)?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_string());
        let temp_file = path.with_file_name(format!(".{}.tmp.{}", file_name, ulid::Ulid::new()));

        debug!("Writing session to temp file: {}", temp_file.display());
        let write = || -> Result<(), std::io::Error> {
            let mut file = fs::File::create(&temp_file)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_file);
            return Err(SessionError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }

        if let Err(e) = fs::rename(&temp_file, path) {
            warn!(
                "Failed to rename {} to {}: {}",
                temp_file.display(),
                path.display(),
                e
            );
            let _ = fs::remove_file(&temp_file);
            return Err(SessionError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }

        info!(
            path = %path.display(),
            tokens = count,
            "session saved"
        );
        Ok(count)
    }

    /// Read a session file holding at most `capacity` tokens.
    pub fn load(path: &Path, capacity: usize) -> Result<PersistedSession, SessionError> {
        if path.as_os_str().is_empty() {
            return Err(SessionError::EmptyPath);
        }
        let data = fs::read(path).map_err(|e| SessionError::io(path, e))?;
        let session = Self::decode(Bytes::from(data), capacity)?;
        info!(
            path = %path.display(),
            tokens = session.tokens.len(),
            "session loaded"
        );
        Ok(session)
    }

    /// Encode the first `count` tokens of `session`.
    pub fn encode(session: &PersistedSession, count: usize) -> Result<Bytes, SessionError> {
        let count = count.min(session.tokens.len());
        let capacity = u32::try_from(session.capacity)
            .map_err(|_| SessionError::Format("capacity does not fit in 32 bits".to_string()))?;
        let count_u32 = u32::try_from(count)
            .map_err(|_| SessionError::Format("token count does not fit in 32 bits".to_string()))?;
        let state_len = u32::try_from(session.engine_state.len())
            .map_err(|_| SessionError::Format("engine state is too large".to_string()))?;

        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + count * 4 + 4 + session.engine_state.len());
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(capacity);
        buf.put_u32_le(count_u32);
        for &token in &session.tokens[..count] {
            buf.put_i32_le(token);
        }
        buf.put_u32_le(state_len);
        buf.put_slice(&session.engine_state);
        Ok(buf.freeze())
    }

    /// Decode a session, refusing files with more than `capacity` tokens.
    pub fn decode(mut data: Bytes, capacity: usize) -> Result<PersistedSession, SessionError> {
        if data.remaining() < HEADER_LEN {
            return Err(SessionError::Format(format!(
                "file is {} bytes, shorter than the {} byte header",
                data.remaining(),
                HEADER_LEN
            )));
        }
        let magic = data.copy_to_bytes(4);
        if magic.as_ref() != MAGIC {
            return Err(SessionError::Format("bad magic".to_string()));
        }
        let version = data.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(SessionError::Format(format!(
                "unsupported version {}",
                version
            )));
        }
        let declared_capacity = data.get_u32_le() as usize;
        let count = data.get_u32_le() as usize;

        if count > capacity {
            return Err(SessionError::CapacityExceeded { count, capacity });
        }
        if data.remaining() < count * 4 + 4 {
            return Err(SessionError::Format(format!(
                "truncated token section: expected {} tokens",
                count
            )));
        }

        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            tokens.push(data.get_i32_le());
        }

        let state_len = data.get_u32_le() as usize;
        if data.remaining() != state_len {
            return Err(SessionError::Format(format!(
                "engine state length {} does not match remaining {} bytes",
                state_len,
                data.remaining()
            )));
        }
        let engine_state = data.copy_to_bytes(state_len).to_vec();

        Ok(PersistedSession {
            capacity: declared_capacity,
            tokens,
            engine_state,
        })
    }
}
