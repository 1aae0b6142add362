use crate::challenge::Challenge;
use crate::matcher::StepResult;
use crate::token::TokenRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Write-once audit record of one verification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub liveness_score: f32,
    pub passed: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
}

/// Durable backing store for challenges, attempts and credentials.
///
/// The store is the single authority for challenge state; the core keeps no
/// cache. `mark_used` must be atomic: it is what gives a challenge its
/// single-shot semantics under concurrent verification attempts.
pub trait ChallengeStore: Send + Sync {
    fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError>;

    fn get_challenge(&self, id: Uuid) -> Result<Option<Challenge>, StorageError>;

    /// Compare-and-set `used` from false to true. Returns false when the
    /// challenge is missing or was already consumed; the caller lost the
    /// race and must treat the challenge as replayed.
    fn mark_used(&self, id: Uuid) -> Result<bool, StorageError>;

    fn put_attempt(&self, attempt: &VerificationAttempt) -> Result<(), StorageError>;

    fn put_token(&self, record: &TokenRecord) -> Result<(), StorageError>;

    fn get_token(&self, token_hash: &str) -> Result<Option<TokenRecord>, StorageError>;
}

/// In-process store. The CAS runs under the map lock, so single-use holds
/// across threads within one process.
#[derive(Default)]
pub struct MemoryStore {
    challenges: Mutex<HashMap<Uuid, Challenge>>,
    attempts: Mutex<Vec<VerificationAttempt>>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

impl ChallengeStore for MemoryStore {
    fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        self.challenges
            .lock()
            .unwrap()
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    fn get_challenge(&self, id: Uuid) -> Result<Option<Challenge>, StorageError> {
        Ok(self.challenges.lock().unwrap().get(&id).cloned())
    }

    fn mark_used(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut challenges = self.challenges.lock().unwrap();
        match challenges.get_mut(&id) {
            Some(challenge) if !challenge.used => {
                challenge.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn put_attempt(&self, attempt: &VerificationAttempt) -> Result<(), StorageError> {
        self.attempts.lock().unwrap().push(attempt.clone());
        Ok(())
    }

    fn put_token(&self, record: &TokenRecord) -> Result<(), StorageError> {
        self.tokens
            .lock()
            .unwrap()
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    fn get_token(&self, token_hash: &str) -> Result<Option<TokenRecord>, StorageError> {
        Ok(self.tokens.lock().unwrap().get(token_hash).cloned())
    }
}

/// Filesystem store: one bincode file per record under
/// `challenges/`, `attempts/` and `tokens/`. Challenge state survives
/// between CLI invocations; the CAS window is serialized by an in-process
/// lock, which is sufficient for a single-process deployment.
pub struct FileStore {
    base_path: PathBuf,
    cas_lock: Mutex<()>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            cas_lock: Mutex::new(()),
        }
    }

    fn challenge_path(&self, id: Uuid) -> PathBuf {
        self.base_path.join("challenges").join(format!("{}.bin", id))
    }

    fn attempt_path(&self, id: Uuid) -> PathBuf {
        self.base_path.join("attempts").join(format!("{}.bin", id))
    }

    fn token_path(&self, token_hash: &str) -> PathBuf {
        self.base_path.join("tokens").join(format!("{}.bin", token_hash))
    }

    fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), StorageError> {
        let dir = path.parent().expect("record path has a parent");
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }

        let data =
            bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn read_record<T: for<'de> Deserialize<'de>>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        bincode::deserialize(&data)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl ChallengeStore for FileStore {
    fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        self.write_record(&self.challenge_path(challenge.id), challenge)
    }

    fn get_challenge(&self, id: Uuid) -> Result<Option<Challenge>, StorageError> {
        self.read_record(&self.challenge_path(id))
    }

    fn mark_used(&self, id: Uuid) -> Result<bool, StorageError> {
        let _guard = self.cas_lock.lock().unwrap();
        let mut challenge: Challenge = match self.read_record(&self.challenge_path(id))? {
            Some(c) => c,
            None => return Ok(false),
        };
        if challenge.used {
            return Ok(false);
        }
        challenge.used = true;
        self.write_record(&self.challenge_path(id), &challenge)?;
        Ok(true)
    }

    fn put_attempt(&self, attempt: &VerificationAttempt) -> Result<(), StorageError> {
        self.write_record(&self.attempt_path(attempt.id), attempt)
    }

    fn put_token(&self, record: &TokenRecord) -> Result<(), StorageError> {
        self.write_record(&self.token_path(&record.token_hash), record)
    }

    fn get_token(&self, token_hash: &str) -> Result<Option<TokenRecord>, StorageError> {
        self.read_record(&self.token_path(token_hash))
    }
}
