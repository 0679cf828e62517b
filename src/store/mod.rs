//! Durable state store shared by every orchestration component
//!
//! One JSON file per record, grouped into per-component namespaces under a
//! single state root. Writes go through a temp file and an atomic rename so
//! a crash mid-write never leaves a visible partial record. Read-modify-write
//! sequences run under a per-namespace advisory lock so concurrent agent
//! processes cannot double-apply a claim.
//!
//! Corruption handling is a per-namespace policy: ephemeral records
//! (sessions, category usage, transition logs) are healed to a default and
//! the recovery is logged; queue and cycle records are quarantined on disk
//! and surfaced as [`MusterError::CorruptState`] instead, since silently
//! erasing a pending review would lose real work.

mod lock;

pub use lock::NamespaceLock;

use crate::retry::RetryConfig;
use crate::{MusterError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Logical namespaces within the store
///
/// Each component owns exactly one namespace, so cross-component contention
/// is impossible; within a namespace, agent processes serialize through the
/// namespace lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// One record per agent session
    Sessions,
    /// The review queue document
    Reviews,
    /// Refinement cycle state, keyed by issue number
    Cycles,
    /// The conflict queue document
    Conflicts,
    /// Category usage map
    Categories,
    /// Per-agent transition logs
    Transitions,
    /// Durable escalation records
    Escalations,
    /// Issue claim ledger
    Claims,
    /// Monitor artifacts (stuck-agent reports)
    Health,
}

/// What to do when a stored record fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealPolicy {
    /// Overwrite the slot with a fresh default and continue
    DefaultAndContinue,
    /// Preserve the corrupt bytes for inspection and surface an error
    Quarantine,
}

impl Namespace {
    /// Directory name under the state root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Namespace::Sessions => "sessions",
            Namespace::Reviews => "reviews",
            Namespace::Cycles => "cycles",
            Namespace::Conflicts => "conflicts",
            Namespace::Categories => "categories",
            Namespace::Transitions => "transitions",
            Namespace::Escalations => "escalations",
            Namespace::Claims => "claims",
            Namespace::Health => "health",
        }
    }

    /// Corruption policy for records in this namespace
    pub fn heal_policy(&self) -> HealPolicy {
        match self {
            Namespace::Sessions
            | Namespace::Categories
            | Namespace::Transitions
            | Namespace::Health => HealPolicy::DefaultAndContinue,
            Namespace::Reviews
            | Namespace::Cycles
            | Namespace::Conflicts
            | Namespace::Escalations
            | Namespace::Claims => HealPolicy::Quarantine,
        }
    }

    fn all() -> [Namespace; 9] {
        [
            Namespace::Sessions,
            Namespace::Reviews,
            Namespace::Cycles,
            Namespace::Conflicts,
            Namespace::Categories,
            Namespace::Transitions,
            Namespace::Escalations,
            Namespace::Claims,
            Namespace::Health,
        ]
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// On-disk envelope carrying a write generation alongside the record
///
/// The generation increases by one on every successful write, so a reader
/// that raced a writer can detect it lost by re-checking the generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    generation: u64,
    record: T,
}

/// File name of the store-wide write stamp
const STAMP_FILE: &str = ".last-write";

/// Durable, crash-safe record store
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (or create) a store rooted at the given directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for ns in Namespace::all() {
            fs::create_dir_all(root.join(ns.dir_name()))?;
        }
        Ok(Self { root })
    }

    /// State root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, ns: Namespace, key: &str) -> PathBuf {
        self.root.join(ns.dir_name()).join(format!("{}.json", key))
    }

    /// Write a record atomically: serialize to a temp file in the target
    /// directory, then rename into place.
    pub fn put<T: Serialize>(&self, ns: Namespace, key: &str, record: &T) -> Result<()> {
        let generation = self.generation(ns, key)?.map_or(1, |g| g + 1);
        self.write_envelope(ns, key, record, generation)
    }

    fn write_envelope<T: Serialize>(
        &self,
        ns: Namespace,
        key: &str,
        record: &T,
        generation: u64,
    ) -> Result<()> {
        let path = self.record_path(ns, key);
        let dir = path
            .parent()
            .ok_or_else(|| MusterError::Storage(format!("No parent directory for {:?}", path)))?;

        let envelope = Envelope { generation, record };
        let json = serde_json::to_vec_pretty(&envelope)?;

        let tmp = NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), &json)?;
        tmp.persist(&path)
            .map_err(|e| MusterError::Storage(format!("Atomic rename failed: {}", e)))?;

        self.touch_stamp();
        debug!(namespace = %ns, key, generation, "Record written");
        Ok(())
    }

    /// Read a record
    ///
    /// A missing file is `Ok(None)`. A file that does not parse is handled
    /// per the namespace's [`HealPolicy`]: healed slots come back as
    /// `Ok(None)` (the caller sees a fresh-start store), quarantined slots
    /// surface [`MusterError::CorruptState`].
    pub fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Result<Option<T>> {
        let path = self.record_path(ns, key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => Ok(Some(envelope.record)),
            Err(e) => self.handle_corrupt(ns, key, &path, e),
        }
    }

    /// Read a record, healing corruption or absence to `T::default()`
    ///
    /// Used by namespaces where liveness beats strict integrity: the corrupt
    /// slot is overwritten with the default and the recovery is logged.
    pub fn get_or_heal<T>(&self, ns: Namespace, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let path = self.record_path(ns, key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => Ok(envelope.record),
            Err(e) => {
                warn!(
                    namespace = %ns,
                    key,
                    error = %e,
                    "Corrupt record healed to default"
                );
                let fresh = T::default();
                self.put(ns, key, &fresh)?;
                Ok(fresh)
            }
        }
    }

    fn handle_corrupt<T>(
        &self,
        ns: Namespace,
        key: &str,
        path: &Path,
        parse_err: serde_json::Error,
    ) -> Result<Option<T>> {
        match ns.heal_policy() {
            HealPolicy::DefaultAndContinue => {
                warn!(
                    namespace = %ns,
                    key,
                    error = %parse_err,
                    "Corrupt record dropped, slot reset"
                );
                fs::remove_file(path)?;
                Ok(None)
            }
            HealPolicy::Quarantine => {
                let quarantine = path.with_extension(format!(
                    "json.corrupt-{}",
                    Utc::now().timestamp_millis()
                ));
                fs::rename(path, &quarantine)?;
                error!(
                    namespace = %ns,
                    key,
                    quarantined = %quarantine.display(),
                    error = %parse_err,
                    "Corrupt record quarantined"
                );
                Err(MusterError::CorruptState {
                    namespace: ns.dir_name().to_string(),
                    key: key.to_string(),
                    detail: parse_err.to_string(),
                })
            }
        }
    }

    /// Read the current write generation of a record, if present
    ///
    /// Parses only the envelope header, so this stays cheap and works even
    /// when the record body's schema has drifted.
    pub fn generation(&self, ns: Namespace, key: &str) -> Result<Option<u64>> {
        #[derive(Deserialize)]
        struct GenOnly {
            #[serde(default)]
            generation: u64,
        }

        let path = self.record_path(ns, key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<GenOnly>(&bytes) {
            Ok(g) => Ok(Some(g.generation)),
            // Unparseable header: treat as generation 0 so the next put
            // still lands; the body-level policy kicks in on the next get.
            Err(_) => Ok(Some(0)),
        }
    }

    /// Atomically read-modify-write a record under the namespace lock
    ///
    /// Loads the record (or its default), applies `f`, writes back with the
    /// generation bumped. The advisory lock is held across the whole
    /// sequence, which is what closes the double-claim race: two processes
    /// cannot both observe the pre-image and both write.
    pub fn update<T, R>(
        &self,
        ns: Namespace,
        key: &str,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let _lock = self.lock(ns)?;

        let mut record: T = match self.get(ns, key)? {
            Some(record) => record,
            None => T::default(),
        };
        let generation = self.generation(ns, key)?.map_or(1, |g| g + 1);

        let result = f(&mut record)?;
        self.write_envelope(ns, key, &record, generation)?;
        Ok(result)
    }

    /// Acquire the advisory lock for a namespace
    ///
    /// Blocks (with bounded backoff) while another process holds it; stale
    /// locks left by a crashed holder are stolen after their TTL.
    pub fn lock(&self, ns: Namespace) -> Result<NamespaceLock> {
        NamespaceLock::acquire(
            self.root.join(ns.dir_name()).join(".lock"),
            &RetryConfig::quick(),
        )
    }

    /// Delete a record; missing records are not an error
    pub fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let path = self.record_path(ns, key);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.touch_stamp();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List record keys in a namespace (quarantined and lock files excluded)
    pub fn list_keys(&self, ns: Namespace) -> Result<Vec<String>> {
        let dir = self.root.join(ns.dir_name());
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Timestamp of the most recent write to any namespace
    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        let meta = fs::metadata(self.root.join(STAMP_FILE)).ok()?;
        let mtime = meta.modified().ok()?;
        Some(DateTime::<Utc>::from(mtime))
    }

    fn touch_stamp(&self) {
        // Best-effort: staleness checks degrade gracefully without it.
        let _ = fs::write(self.root.join(STAMP_FILE), b"");
    }
}
