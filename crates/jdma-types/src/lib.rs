//! Shared types and identifiers for JDMA.
//!
//! This crate defines the core types used across the JDMA workspace:
//! identifiers ([`BatchId`], [`RequestId`], [`BackendId`], [`PartHandle`]),
//! the persisted domain model ([`Batch`], [`Request`], [`ArchivePart`],
//! [`QuotaRecord`], [`User`]), the per-request-type state tables
//! ([`RequestKind::stages`]), the failure taxonomy ([`FailureReason`]) and
//! orchestrator configuration ([`OrchestratorConfig`]).

pub mod events;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw numeric identifier.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Return the raw numeric identifier.
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Big-endian encoding, used for ordered storage keys.
            pub fn to_be_bytes(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Decode from the big-endian storage key form.
            pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
                Self(u64::from_be_bytes(bytes))
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a batch, allocated monotonically by the orchestrator store.
    BatchId
);

define_id!(
    /// Identifier of a request, allocated monotonically by the orchestrator store.
    RequestId
);

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}

define_name!(
    /// Name of a registered storage backend (e.g. `"objectstore"`, `"elastictape"`).
    BackendId
);

define_name!(
    /// Opaque locator assigned by a storage backend to a stored archive part.
    PartHandle
);

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// SHA-256 content digest used for archive parts and individual files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash everything a reader yields, in 64 KiB blocks.
    pub fn of_reader<R: std::io::Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Hash a file on disk. Blocking.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        Self::of_reader(std::io::BufReader::new(std::fs::File::open(path)?))
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "Digest({})", &hex[..16])
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// The family a storage backend belongs to.
///
/// The orchestrator never branches on this except to pick concurrency limits
/// and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Object store (S3-like): fast, highly concurrent.
    ObjectStore,
    /// Tape-backed elastic store: slow recalls, few drives.
    Tape,
    /// On-disk cache.
    Disk,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectStore => "object_store",
            Self::Tape => "tape",
            Self::Disk => "disk",
        })
    }
}

// ---------------------------------------------------------------------------
// Batches and archive parts
// ---------------------------------------------------------------------------

/// Aggregate stage of a batch, independent of the request currently acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStage {
    /// Files are only in the staging workspace.
    OnDisk,
    /// A PUT or MIGRATE is in progress.
    Putting,
    /// All parts are stored on the batch's backend.
    OnStorage,
    /// A PUT, MIGRATE or DELETE failed part-way.
    Failed,
    /// A DELETE is in progress.
    Deleting,
    /// All parts have been removed from the backend.
    Deleted,
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OnDisk => "ON_DISK",
            Self::Putting => "PUTTING",
            Self::OnStorage => "ON_STORAGE",
            Self::Failed => "FAILED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        })
    }
}

/// One source file belonging to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to [`Batch::root`], `/`-separated.
    pub path: String,
    /// Size in bytes at registration time.
    pub size: u64,
    /// SHA-256 of the file contents, filled in when the batch is packed.
    pub digest: Option<Digest>,
}

/// A named, ordered collection of source files submitted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier.
    pub id: BatchId,
    /// User-facing label.
    pub label: String,
    /// Owning user.
    pub owner: String,
    /// Owning workspace.
    pub workspace: String,
    /// Backend the batch is (or will be) stored on.
    pub backend: BackendId,
    /// Deepest common directory of all source files.
    pub root: PathBuf,
    /// Source files, in submission order.
    pub files: Vec<FileEntry>,
    /// Sum of all file sizes.
    pub total_bytes: u64,
    /// Aggregate stage.
    pub stage: BatchStage,
    /// Creation time (unix milliseconds).
    pub created_at: u64,
    /// Last modification time (unix milliseconds).
    pub updated_at: u64,
}

impl Batch {
    /// Absolute source path of a member file.
    pub fn source_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// One packed, independently verifiable unit of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePart {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Sequence index within the batch (0-based).
    pub index: u32,
    /// Size of the packed archive in bytes.
    pub size: u64,
    /// SHA-256 of the packed archive.
    pub checksum: Digest,
    /// Relative paths of the files inside this part.
    pub files: Vec<String>,
    /// Handle on the batch's backend, set once uploaded.
    pub handle: Option<PartHandle>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// The type of a request against a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Pack and upload the batch.
    Put,
    /// Download and unpack the batch.
    Get,
    /// Remove the batch from its backend.
    Delete,
    /// Pack and upload the batch, then remove its source files.
    Migrate,
}

impl RequestKind {
    /// The ordered happy-path states for this request type, ending in `Completed`.
    pub fn stages(self) -> &'static [RequestState] {
        use RequestState::*;
        match self {
            RequestKind::Put => &[
                Pending,
                Packing,
                TransferStart,
                Transferring,
                Tidying,
                Completed,
            ],
            RequestKind::Get => &[
                Pending,
                TransferStart,
                Restoring,
                Unpacking,
                Tidying,
                Completed,
            ],
            RequestKind::Delete => &[Pending, DeleteStart, Tidying, Completed],
            RequestKind::Migrate => &[
                Pending,
                TransferStart,
                Transferring,
                Verifying,
                Completed,
            ],
        }
    }

    /// The state that follows `current` on the happy path, if any.
    pub fn next_state(self, current: RequestState) -> Option<RequestState> {
        let stages = self.stages();
        let pos = stages.iter().position(|s| *s == current)?;
        stages.get(pos + 1).copied()
    }

    /// Whether `from → to` is a legal transition for this request type.
    pub fn is_valid_transition(self, from: RequestState, to: RequestState) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == RequestState::Failed {
            return self.stages().contains(&from);
        }
        self.next_state(from) == Some(to)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Put => "PUT",
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Migrate => "MIGRATE",
        })
    }
}

/// State of a request. Which states are reachable depends on the [`RequestKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Packing,
    TransferStart,
    Transferring,
    Restoring,
    Unpacking,
    Verifying,
    DeleteStart,
    Tidying,
    Completed,
    Failed,
}

impl RequestState {
    /// All states, in code order.
    pub const ALL: [RequestState; 11] = [
        Self::Pending,
        Self::Packing,
        Self::TransferStart,
        Self::Transferring,
        Self::Restoring,
        Self::Unpacking,
        Self::Verifying,
        Self::DeleteStart,
        Self::Tidying,
        Self::Completed,
        Self::Failed,
    ];

    /// `Completed` and `Failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable numeric code, used as the state index key prefix.
    pub fn code(self) -> u16 {
        match self {
            Self::Pending => 1,
            Self::Packing => 2,
            Self::TransferStart => 3,
            Self::Transferring => 4,
            Self::Restoring => 5,
            Self::Unpacking => 6,
            Self::Verifying => 7,
            Self::DeleteStart => 8,
            Self::Tidying => 9,
            Self::Completed => 100,
            Self::Failed => 101,
        }
    }

    /// Inverse of [`RequestState::code`].
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Packing => "PACKING",
            Self::TransferStart => "TRANSFER_START",
            Self::Transferring => "TRANSFERRING",
            Self::Restoring => "RESTORING",
            Self::Unpacking => "UNPACKING",
            Self::Verifying => "VERIFYING",
            Self::DeleteStart => "DELETE_START",
            Self::Tidying => "TIDYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        })
    }
}

/// Structured reason recorded on a request that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureReason {
    /// The workspace does not have enough free quota on the backend.
    #[error("quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        /// Bytes the request needed.
        requested: u64,
        /// Bytes that were free.
        available: u64,
    },

    /// A source file disappeared before packing.
    #[error("source file missing: {path}")]
    SourceMissing {
        /// The missing path.
        path: String,
    },

    /// The backend copy of a part is missing.
    #[error("data unavailable: {detail}")]
    DataUnavailable {
        /// What was missing.
        detail: String,
    },

    /// A checksum did not match.
    #[error("corrupt data in part {part}: expected {expected}, got {actual}")]
    CorruptData {
        /// Part index.
        part: u32,
        /// Checksum recorded at packing time.
        expected: Digest,
        /// Checksum actually observed.
        actual: Digest,
    },

    /// The backend stayed unreachable after its retry budget was spent.
    #[error("backend {backend} unavailable: {detail}")]
    BackendUnavailable {
        /// Backend name.
        backend: String,
        /// Last error seen.
        detail: String,
    },

    /// The request stalled twice in the given state.
    #[error("stage timed out in {state}")]
    StageTimeout {
        /// State the request was stuck in.
        state: RequestState,
    },

    /// An operator cancelled the request.
    #[error("cancelled by operator")]
    Cancelled,

    /// An orchestrator-side fault (metadata store, local I/O).
    #[error("internal error: {detail}")]
    Internal {
        /// Error description.
        detail: String,
    },
}

impl FailureReason {
    /// Short, stable name of the failure category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::SourceMissing { .. } => "SourceMissing",
            Self::DataUnavailable { .. } => "DataUnavailable",
            Self::CorruptData { .. } => "CorruptData",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::StageTimeout { .. } => "StageTimeout",
            Self::Cancelled => "Cancelled",
            Self::Internal { .. } => "Internal",
        }
    }
}

/// Kind-specific parameters supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    /// User submitting the request; must own the batch.
    pub requester: String,
    /// GET: directory the files are restored under.
    pub target_path: Option<PathBuf>,
    /// GET: restrict the restore to these relative paths (empty = all).
    pub files: Vec<String>,
}

/// A scheduler's claim on a request it is currently advancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Scheduler instance id.
    pub owner: String,
    /// When the claim was taken (unix milliseconds).
    pub at: u64,
}

/// One transfer operation against a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier.
    pub id: RequestId,
    /// Batch this request acts on.
    pub batch_id: BatchId,
    /// Request type.
    pub kind: RequestKind,
    /// Current state.
    pub state: RequestState,
    /// Submission parameters.
    pub params: RequestParams,
    /// Why the request failed (only set in `Failed`).
    pub failure: Option<FailureReason>,
    /// State the request was in when it failed.
    pub failed_in: Option<RequestState>,
    /// Creation time (unix milliseconds).
    pub created_at: u64,
    /// Last state write (unix milliseconds).
    pub updated_at: u64,
    /// Active scheduler claim, if a worker holds this request.
    pub claim: Option<Claim>,
    /// How many times this request has been requeued after stalling.
    pub stall_count: u32,
    /// The failed request this one was cloned from by an operator retry.
    pub retry_of: Option<RequestId>,
}

impl Request {
    /// Build a fresh `Pending` request.
    pub fn new(
        id: RequestId,
        batch_id: BatchId,
        kind: RequestKind,
        params: RequestParams,
        now: u64,
    ) -> Self {
        Self {
            id,
            batch_id,
            kind,
            state: RequestState::Pending,
            params,
            failure: None,
            failed_in: None,
            created_at: now,
            updated_at: now,
            claim: None,
            stall_count: 0,
            retry_of: None,
        }
    }

    /// Whether the request is `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// User-visible status snapshot.
    pub fn status(&self) -> RequestStatus {
        RequestStatus {
            id: self.id,
            batch_id: self.batch_id,
            kind: self.kind,
            state: self.state,
            failure: self.failure.clone(),
            failed_in: self.failed_in,
            updated_at: self.updated_at,
        }
    }
}

/// What `get_request_status` returns: the last durable state of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub id: RequestId,
    pub batch_id: BatchId,
    pub kind: RequestKind,
    pub state: RequestState,
    pub failure: Option<FailureReason>,
    pub failed_in: Option<RequestState>,
    pub updated_at: u64,
}

// ---------------------------------------------------------------------------
// Quota and users
// ---------------------------------------------------------------------------

/// Capacity accounting for one (workspace, backend) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Workspace name.
    pub workspace: String,
    /// Backend the allocation applies to.
    pub backend: BackendId,
    /// Capacity ceiling in bytes.
    pub allocated: u64,
    /// Bytes held by completed transfers; always the sum of `stored`.
    pub consumed: u64,
    /// Outstanding reservations, keyed by the request that holds them.
    pub reservations: BTreeMap<RequestId, u64>,
    /// Committed bytes per batch stored on the backend.
    pub stored: BTreeMap<BatchId, u64>,
}

impl QuotaRecord {
    /// A fresh record with nothing consumed.
    pub fn new(workspace: impl Into<String>, backend: BackendId, allocated: u64) -> Self {
        Self {
            workspace: workspace.into(),
            backend,
            allocated,
            consumed: 0,
            reservations: BTreeMap::new(),
            stored: BTreeMap::new(),
        }
    }

    /// Sum of all outstanding reservations.
    pub fn reserved(&self) -> u64 {
        self.reservations.values().sum()
    }

    /// Bytes either consumed or promised to a running request.
    pub fn in_use(&self) -> u64 {
        self.consumed.saturating_add(self.reserved())
    }

    /// Capacity neither consumed nor reserved.
    pub fn available(&self) -> u64 {
        self.allocated
            .saturating_sub(self.consumed)
            .saturating_sub(self.reserved())
    }
}

/// A registered user and their notification preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub name: String,
    /// Address completion/failure messages are sent to.
    pub email: Option<String>,
    /// Whether the user wants notifications at all.
    pub notify: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the state machine and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root of the staging area for packed and restored parts.
    pub staging_dir: PathBuf,
    /// Maximum payload bytes per archive part.
    pub part_ceiling: u64,
    /// Verify every retrieved part before unpacking anything (fail closed).
    pub verify_before_unpack: bool,
    /// How long a request may sit in one active state before it is treated as stalled.
    pub staleness_window: Duration,
    /// Interval between scheduler scans.
    pub poll_interval: Duration,
    /// Identity written into claims taken by this scheduler instance.
    pub scheduler_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("jdma-staging"),
            part_ceiling: 256 * 1024 * 1024, // 256 MB
            verify_before_unpack: true,
            staleness_window: Duration::from_secs(6 * 60 * 60),
            poll_interval: Duration::from_secs(5),
            scheduler_id: "jdmad".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Staging directory for a batch.
    pub fn batch_staging(&self, batch_id: BatchId) -> PathBuf {
        self.staging_dir.join(format!("batch-{batch_id}"))
    }

    /// Staging directory for one request on a batch.
    pub fn request_staging(&self, batch_id: BatchId, request_id: RequestId) -> PathBuf {
        self.batch_staging(batch_id)
            .join(format!("request-{request_id}"))
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Render a path relative to `root` with `/` separators.
///
/// Returns `None` if `path` is not under `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
