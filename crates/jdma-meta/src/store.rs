//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use jdma_types::{
    ArchivePart, Batch, BatchId, BackendId, QuotaRecord, Request, RequestId, RequestState, User,
    now_millis,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

const BATCH_COUNTER: &str = "batch";
const REQUEST_COUNTER: &str = "request";

/// Orchestrator store backed by Fjall.
///
/// Every read-modify-write goes through `write_lock`, which makes
/// conditional request writes and quota updates atomic with respect to each
/// other within one process.
pub struct MetaStore {
    #[allow(dead_code)]
    db: Database,
    batches: Keyspace,
    requests: Keyspace,
    request_index: Keyspace,
    batch_active: Keyspace,
    parts: Keyspace,
    quota: Keyspace,
    users: Keyspace,
    counters: Keyspace,
    write_lock: Mutex<()>,
    // Declared last so the database is dropped before its directory goes away.
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path.as_ref()).open()?;
        let store = Self::init_keyspaces(db, None)?;
        store.rebuild_indexes()?;
        info!(path = %path.as_ref().display(), "opened orchestrator store");
        Ok(store)
    }

    /// Open a temporary store that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let batches = db.keyspace("batches", KeyspaceCreateOptions::default)?;
        let requests = db.keyspace("requests", KeyspaceCreateOptions::default)?;
        let request_index = db.keyspace("request_index", KeyspaceCreateOptions::default)?;
        let batch_active = db.keyspace("batch_active", KeyspaceCreateOptions::default)?;
        let parts = db.keyspace("parts", KeyspaceCreateOptions::default)?;
        let quota = db.keyspace("quota", KeyspaceCreateOptions::default)?;
        let users = db.keyspace("users", KeyspaceCreateOptions::default)?;
        let counters = db.keyspace("counters", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            batches,
            requests,
            request_index,
            batch_active,
            parts,
            quota,
            users,
            counters,
            write_lock: Mutex::new(()),
            _tmp: tmp,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().expect("meta write lock poisoned")
    }

    // ----- Id allocation -----

    fn next_id(&self, name: &str) -> Result<u64> {
        let _guard = self.lock();
        let current = match self.counters.get(name.as_bytes())? {
            Some(bytes) => u64::from_be_bytes(
                bytes[..]
                    .try_into()
                    .map_err(|_| MetaError::MalformedKey { keyspace: "counters" })?,
            ),
            None => 0,
        };
        let next = current + 1;
        self.counters
            .insert(name.as_bytes(), &next.to_be_bytes()[..])?;
        Ok(next)
    }

    /// Allocate the next batch id (monotonic, starting at 1).
    pub fn allocate_batch_id(&self) -> Result<BatchId> {
        self.next_id(BATCH_COUNTER).map(BatchId::new)
    }

    /// Allocate the next request id (monotonic, starting at 1).
    pub fn allocate_request_id(&self) -> Result<RequestId> {
        self.next_id(REQUEST_COUNTER).map(RequestId::new)
    }

    // ----- Batches -----

    /// Store a batch, replacing any previous version.
    pub fn put_batch(&self, batch: &Batch) -> Result<()> {
        self.batches
            .insert(&batch.id.to_be_bytes()[..], encode(batch)?.as_slice())?;
        debug!(batch_id = %batch.id, stage = %batch.stage, "stored batch");
        Ok(())
    }

    pub fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        get_typed(&self.batches, &id.to_be_bytes())
    }

    /// All batches, in id order.
    pub fn list_batches(&self) -> Result<Vec<Batch>> {
        scan_values(&self.batches)
    }

    /// Apply `mutate` to a stored batch and write it back.
    pub fn update_batch(&self, id: BatchId, mutate: impl FnOnce(&mut Batch)) -> Result<Batch> {
        let _guard = self.lock();
        let mut batch = self.get_batch(id)?.ok_or(MetaError::BatchNotFound(id))?;
        mutate(&mut batch);
        batch.updated_at = now_millis();
        self.put_batch(&batch)?;
        Ok(batch)
    }

    // ----- Requests -----

    /// Persist a new request, enforcing at most one non-terminal request per batch.
    ///
    /// Fails with [`MetaError::BatchBusy`] if the batch already has one.
    pub fn insert_request(&self, request: &Request) -> Result<()> {
        let _guard = self.lock();
        if let Some(active) = self.active_request_unlocked(request.batch_id)? {
            return Err(MetaError::BatchBusy {
                batch: request.batch_id,
                active,
            });
        }
        self.write_request_unlocked(request, None)?;
        debug!(request_id = %request.id, batch_id = %request.batch_id, kind = %request.kind, "inserted request");
        Ok(())
    }

    pub fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        get_typed(&self.requests, &id.to_be_bytes())
    }

    /// Conditionally update a request.
    ///
    /// Fails with [`MetaError::StateConflict`] unless the stored state equals
    /// `expected`. `mutate` may decline the write by returning `false`, in
    /// which case `Ok(None)` is returned and nothing changes. The updated
    /// timestamp is refreshed whenever the state changes.
    pub fn try_update_request(
        &self,
        id: RequestId,
        expected: RequestState,
        mutate: impl FnOnce(&mut Request) -> bool,
    ) -> Result<Option<Request>> {
        let _guard = self.lock();
        let mut request = self.get_request(id)?.ok_or(MetaError::RequestNotFound(id))?;
        if request.state != expected {
            return Err(MetaError::StateConflict {
                id,
                expected,
                actual: request.state,
            });
        }
        if !mutate(&mut request) {
            return Ok(None);
        }
        if request.state != expected {
            request.updated_at = now_millis();
        }
        self.write_request_unlocked(&request, Some(expected))?;
        Ok(Some(request))
    }

    /// Conditionally update a request; `mutate` always applies.
    pub fn transition_request(
        &self,
        id: RequestId,
        expected: RequestState,
        mutate: impl FnOnce(&mut Request),
    ) -> Result<Request> {
        let updated = self.try_update_request(id, expected, |request| {
            mutate(request);
            true
        })?;
        updated.ok_or(MetaError::RequestNotFound(id))
    }

    /// All requests, in id order.
    pub fn list_requests(&self) -> Result<Vec<Request>> {
        scan_values(&self.requests)
    }

    /// Every request ever made against a batch, oldest first.
    pub fn requests_for_batch(&self, batch_id: BatchId) -> Result<Vec<Request>> {
        Ok(self
            .list_requests()?
            .into_iter()
            .filter(|r| r.batch_id == batch_id)
            .collect())
    }

    /// Requests currently in `state`, found through the state index.
    pub fn requests_in_state(&self, state: RequestState) -> Result<Vec<Request>> {
        let mut out = Vec::new();
        for guard in self.request_index.prefix(&state.code().to_be_bytes()[..]) {
            let key = guard.key()?;
            let id = decode_index_key(&key)?;
            if let Some(request) = self.get_request(id)? {
                out.push(request);
            }
        }
        Ok(out)
    }

    /// All non-terminal requests.
    pub fn active_requests(&self) -> Result<Vec<Request>> {
        let mut out = Vec::new();
        for state in RequestState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            out.extend(self.requests_in_state(state)?);
        }
        Ok(out)
    }

    /// The non-terminal request on a batch, if any.
    pub fn active_request_for(&self, batch_id: BatchId) -> Result<Option<RequestId>> {
        let _guard = self.lock();
        self.active_request_unlocked(batch_id)
    }

    fn active_request_unlocked(&self, batch_id: BatchId) -> Result<Option<RequestId>> {
        let Some(bytes) = self.batch_active.get(&batch_id.to_be_bytes()[..])? else {
            return Ok(None);
        };
        let id = RequestId::from_be_bytes(
            bytes[..]
                .try_into()
                .map_err(|_| MetaError::MalformedKey { keyspace: "batch_active" })?,
        );
        match self.get_request(id)? {
            Some(request) if !request.is_terminal() => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    fn write_request_unlocked(&self, request: &Request, previous: Option<RequestState>) -> Result<()> {
        self.requests
            .insert(&request.id.to_be_bytes()[..], encode(request)?.as_slice())?;

        if previous != Some(request.state) {
            if let Some(prev) = previous {
                self.request_index
                    .remove(index_key(prev, request.id).as_slice())?;
            }
            self.request_index
                .insert(index_key(request.state, request.id).as_slice(), &b""[..])?;
        }

        let batch_key = request.batch_id.to_be_bytes();
        if request.is_terminal() {
            if let Some(bytes) = self.batch_active.get(&batch_key[..])?
                && bytes[..] == request.id.to_be_bytes()[..]
            {
                self.batch_active.remove(&batch_key[..])?;
            }
        } else {
            self.batch_active
                .insert(&batch_key[..], &request.id.to_be_bytes()[..])?;
        }
        Ok(())
    }

    /// Rebuild `request_index` and `batch_active` from `requests`.
    pub fn rebuild_indexes(&self) -> Result<()> {
        let _guard = self.lock();
        for keyspace in [&self.request_index, &self.batch_active] {
            let mut keys = Vec::new();
            for guard in keyspace.iter() {
                keys.push(guard.key()?.to_vec());
            }
            for key in keys {
                keyspace.remove(key.as_slice())?;
            }
        }

        let mut active = 0usize;
        for request in scan_values::<Request>(&self.requests)? {
            self.write_request_unlocked(&request, None)?;
            if !request.is_terminal() {
                active += 1;
            }
        }
        debug!(active, "rebuilt request indexes");
        Ok(())
    }

    // ----- Archive parts -----

    /// Store a part row, replacing any previous version.
    pub fn put_part(&self, part: &ArchivePart) -> Result<()> {
        self.parts.insert(
            part_key(part.batch_id, part.index).as_slice(),
            encode(part)?.as_slice(),
        )?;
        Ok(())
    }

    /// All parts of a batch, in index order.
    pub fn get_parts(&self, batch_id: BatchId) -> Result<Vec<ArchivePart>> {
        let mut parts = Vec::new();
        for guard in self.parts.prefix(&batch_id.to_be_bytes()[..]) {
            let value = guard.value()?;
            parts.push(decode(&value)?);
        }
        Ok(parts)
    }

    /// Apply `mutate` to one part row. Returns `None` if the part does not exist.
    pub fn update_part(
        &self,
        batch_id: BatchId,
        index: u32,
        mutate: impl FnOnce(&mut ArchivePart),
    ) -> Result<Option<ArchivePart>> {
        let _guard = self.lock();
        let key = part_key(batch_id, index);
        let Some(mut part) = get_typed::<ArchivePart>(&self.parts, &key)? else {
            return Ok(None);
        };
        mutate(&mut part);
        self.parts.insert(key.as_slice(), encode(&part)?.as_slice())?;
        Ok(Some(part))
    }

    /// Remove every part row of a batch, returning how many were removed.
    pub fn delete_parts(&self, batch_id: BatchId) -> Result<usize> {
        let _guard = self.lock();
        let mut keys = Vec::new();
        for guard in self.parts.prefix(&batch_id.to_be_bytes()[..]) {
            keys.push(guard.key()?.to_vec());
        }
        for key in &keys {
            self.parts.remove(key.as_slice())?;
        }
        debug!(%batch_id, removed = keys.len(), "deleted part rows");
        Ok(keys.len())
    }

    // ----- Quota -----

    pub fn get_quota(&self, workspace: &str, backend: &BackendId) -> Result<Option<QuotaRecord>> {
        get_typed(&self.quota, &quota_key(workspace, backend))
    }

    /// All quota records.
    pub fn list_quotas(&self) -> Result<Vec<QuotaRecord>> {
        scan_values(&self.quota)
    }

    /// Atomically read, modify and write one quota record.
    ///
    /// A missing record starts with zero allocation. Nothing is written if
    /// `mutate` returns an error.
    pub fn modify_quota<T, E>(
        &self,
        workspace: &str,
        backend: &BackendId,
        mutate: impl FnOnce(&mut QuotaRecord) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<MetaError>,
    {
        let _guard = self.lock();
        let key = quota_key(workspace, backend);
        let mut record = self
            .get_quota(workspace, backend)?
            .unwrap_or_else(|| QuotaRecord::new(workspace, backend.clone(), 0));
        let out = mutate(&mut record)?;
        let value = encode(&record)?;
        self.quota
            .insert(key.as_slice(), value.as_slice())
            .map_err(MetaError::from)?;
        Ok(out)
    }

    // ----- Users -----

    pub fn put_user(&self, user: &User) -> Result<()> {
        self.users
            .insert(user.name.as_bytes(), encode(user)?.as_slice())?;
        debug!(user = %user.name, "stored user");
        Ok(())
    }

    pub fn get_user(&self, name: &str) -> Result<Option<User>> {
        get_typed(&self.users, name.as_bytes())
    }

    /// All users, ordered by name.
    pub fn list_users(&self) -> Result<Vec<User>> {
        scan_values(&self.users)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

fn get_typed<T: DeserializeOwned>(keyspace: &Keyspace, key: &[u8]) -> Result<Option<T>> {
    match keyspace.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn scan_values<T: DeserializeOwned>(keyspace: &Keyspace) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for guard in keyspace.iter() {
        let value = guard.value()?;
        out.push(decode(&value)?);
    }
    Ok(out)
}

/// `state code (2 bytes BE) ++ request id (8 bytes BE)`.
///
/// Big-endian ids keep each state's requests in id order.
fn index_key(state: RequestState, id: RequestId) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.extend_from_slice(&state.code().to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_index_key(key: &[u8]) -> Result<RequestId> {
    let id: [u8; 8] = key
        .get(2..10)
        .and_then(|s| s.try_into().ok())
        .ok_or(MetaError::MalformedKey {
            keyspace: "request_index",
        })?;
    Ok(RequestId::from_be_bytes(id))
}

/// `batch id (8 bytes BE) ++ part index (4 bytes BE)`.
fn part_key(batch_id: BatchId, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&batch_id.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// `workspace length (4 bytes BE) ++ workspace ++ backend`.
///
/// The length prefix keeps every (workspace, backend) pair distinct whatever
/// characters the names contain.
fn quota_key(workspace: &str, backend: &BackendId) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + workspace.len() + backend.as_str().len());
    key.extend_from_slice(&(workspace.len() as u32).to_be_bytes());
    key.extend_from_slice(workspace.as_bytes());
    key.extend_from_slice(backend.as_str().as_bytes());
    key
}
