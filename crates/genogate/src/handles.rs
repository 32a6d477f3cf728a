//! Handle-based remote file sessions.
//!
//! The table is an arena of entries keyed by uuid. The map lock is held only for lookup, insert
//! and remove; each entry carries its own mutex that is held for the whole of a read, write or
//! close, so a second caller on the same handle waits for the first. The map lock is never held
//! while waiting on an entry lock.

use std::collections::HashMap;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Principal;
use crate::config::schema::HandlesConfig;
use crate::error::{GatewayError, Result};
use crate::store::ExternalStore;

/// Opaque handle returned by `create` and `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle {
    pub uuid: Uuid,
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleMode {
    Read,
    Write,
}

enum Stream {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn Write + Send>),
}

struct Session {
    stream: Stream,
    cursor: u64,
}

impl Session {
    fn finish(self) -> std::io::Result<()> {
        match self.stream {
            Stream::Writer(mut writer) => writer.flush(),
            Stream::Reader(_) => Ok(()),
        }
    }
}

struct HandleEntry {
    mode: HandleMode,
    path: String,
    owner: String,
    /// `None` while the stream is being opened and once the handle has been closed.
    session: Mutex<Option<Session>>,
    /// Milliseconds since the table epoch.
    last_used: AtomicU64,
}

impl HandleEntry {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Handle session lock poisoned for {}, recovering", self.path);
                poisoned.into_inner()
            }
        }
    }
}

pub struct HandleTable {
    store: Arc<dyn ExternalStore>,
    entries: RwLock<HashMap<Uuid, Arc<HandleEntry>>>,
    read_chunk_bytes: usize,
    max_open_handles: usize,
    epoch: Instant,
}

impl HandleTable {
    pub fn new(store: Arc<dyn ExternalStore>, config: &HandlesConfig) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            read_chunk_bytes: config.read_chunk_bytes,
            max_open_handles: config.max_open_handles,
            epoch: Instant::now(),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<HandleEntry>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Handle table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<HandleEntry>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Handle table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Opens `path` for writing, truncating or creating it.
    pub fn create(&self, path: &str, principal: &Principal) -> Result<FileHandle> {
        let qualified = self.qualify(path, principal)?;
        let handle = self.insert(HandleMode::Write, qualified, principal, || {
            self.store
                .create(path, &principal.username)
                .map(Stream::Writer)
                .map_err(|e| GatewayError::Io(e.to_string()))
        })?;
        log::debug!("Created {} for {} as {}", path, principal.username, handle);
        Ok(handle)
    }

    /// Opens `path` for reading.
    pub fn open(&self, path: &str, principal: &Principal) -> Result<FileHandle> {
        let qualified = self.qualify(path, principal)?;
        let handle = self.insert(HandleMode::Read, qualified, principal, || {
            Ok(Stream::Reader(self.store.open(path, &principal.username)?))
        })?;
        log::debug!("Opened {} for {} as {}", path, principal.username, handle);
        Ok(handle)
    }

    /// Appends `bytes` at the cursor.
    pub fn write(&self, handle: &FileHandle, bytes: &[u8], principal: &Principal) -> Result<()> {
        let entry = self.lookup(handle, principal, Some(HandleMode::Write))?;
        let mut guard = entry.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| GatewayError::InvalidHandle(format!("handle {} is closed", handle)))?;

        let Stream::Writer(writer) = &mut session.stream else {
            return Err(GatewayError::InvalidHandle(format!(
                "handle {} is not open for writing",
                handle
            )));
        };
        writer
            .write_all(bytes)
            .map_err(|e| GatewayError::Io(format!("write to {} failed: {}", entry.path, e)))?;
        session.cursor += bytes.len() as u64;
        entry.last_used.store(self.now_ms(), Ordering::Relaxed);

        Ok(())
    }

    /// Returns the next chunk from the cursor; empty at end of stream.
    pub fn read(&self, handle: &FileHandle, principal: &Principal) -> Result<Vec<u8>> {
        let entry = self.lookup(handle, principal, Some(HandleMode::Read))?;
        let mut guard = entry.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| GatewayError::InvalidHandle(format!("handle {} is closed", handle)))?;

        let Stream::Reader(reader) = &mut session.stream else {
            return Err(GatewayError::InvalidHandle(format!(
                "handle {} is not open for reading",
                handle
            )));
        };

        let mut buf = vec![0u8; self.read_chunk_bytes];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(GatewayError::Io(format!(
                        "read from {} failed: {}",
                        entry.path, e
                    )))
                }
            }
        };
        buf.truncate(n);
        session.cursor += n as u64;
        entry.last_used.store(self.now_ms(), Ordering::Relaxed);

        Ok(buf)
    }

    /// Flushes and retires the handle. A second close fails with `InvalidHandleError`.
    pub fn close(&self, handle: &FileHandle, principal: &Principal) -> Result<()> {
        let entry = self.lookup(handle, principal, None)?;
        let mut guard = entry.lock();
        let session = guard
            .take()
            .ok_or_else(|| GatewayError::InvalidHandle(format!("handle {} is closed", handle)))?;
        self.retire(handle.uuid, &entry);
        drop(guard);

        log::debug!("Closed {} ({} bytes)", handle, session.cursor);
        session
            .finish()
            .map_err(|e| GatewayError::Io(format!("flush of {} failed: {}", entry.path, e)))
    }

    pub fn open_count(&self) -> usize {
        self.read_entries().len()
    }

    /// Force-closes handles unused for longer than `idle`. Busy handles and handles still being
    /// opened are skipped.
    pub fn reap_idle(&self, idle: Duration) -> usize {
        let now = self.now_ms();
        let idle_ms = idle.as_millis() as u64;
        let candidates: Vec<(Uuid, Arc<HandleEntry>)> = self
            .read_entries()
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_used.load(Ordering::Relaxed)) > idle_ms)
            .map(|(id, e)| (*id, Arc::clone(e)))
            .collect();

        let mut reaped = 0;
        for (id, entry) in candidates {
            let mut guard = match entry.session.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("Handle session lock poisoned for {}, recovering", entry.path);
                    poisoned.into_inner()
                }
            };
            // Touched while we were collecting candidates.
            if now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) <= idle_ms {
                continue;
            }
            if let Some(session) = guard.take() {
                self.retire(id, &entry);
                if let Err(e) = session.finish() {
                    log::warn!("Failed to flush idle handle {} ({}): {}", id, entry.path, e);
                }
                reaped += 1;
            }
        }

        if reaped > 0 {
            log::info!("Reaped {} idle file handles", reaped);
        }
        reaped
    }

    /// Closes every open handle. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(Uuid, Arc<HandleEntry>)> = self.write_entries().drain().collect();
        let mut closed = 0;
        for (id, entry) in drained {
            if let Some(session) = entry.lock().take() {
                if let Err(e) = session.finish() {
                    log::warn!("Failed to flush handle {} ({}): {}", id, entry.path, e);
                }
                closed += 1;
            }
        }
        closed
    }

    fn qualify(&self, path: &str, principal: &Principal) -> Result<String> {
        self.store
            .qualify(path, &principal.username)
            .map_err(|e| GatewayError::Io(e.to_string()))
    }

    /// Claims a slot, then opens the stream while holding the new entry's lock.
    ///
    /// The capacity check and the insert happen under one map lock. The store is only touched
    /// once a slot is held, and the slot is given back if opening fails.
    fn insert<F>(
        &self,
        mode: HandleMode,
        path: String,
        principal: &Principal,
        open_stream: F,
    ) -> Result<FileHandle>
    where
        F: FnOnce() -> Result<Stream>,
    {
        let entry = Arc::new(HandleEntry {
            mode,
            path,
            owner: principal.username.clone(),
            session: Mutex::new(None),
            last_used: AtomicU64::new(self.now_ms()),
        });
        let mut session = entry.lock();

        let uuid = {
            let mut entries = self.write_entries();
            if entries.len() >= self.max_open_handles {
                return Err(GatewayError::Io(format!(
                    "too many open file handles (limit {})",
                    self.max_open_handles
                )));
            }
            let uuid = loop {
                let candidate = Uuid::new_v4();
                if !entries.contains_key(&candidate) {
                    break candidate;
                }
            };
            entries.insert(uuid, Arc::clone(&entry));
            uuid
        };

        match open_stream() {
            Ok(stream) => {
                *session = Some(Session { stream, cursor: 0 });
                Ok(FileHandle { uuid })
            }
            Err(e) => {
                self.retire(uuid, &entry);
                Err(e)
            }
        }
    }

    fn lookup(
        &self,
        handle: &FileHandle,
        principal: &Principal,
        mode: Option<HandleMode>,
    ) -> Result<Arc<HandleEntry>> {
        let entry = self
            .read_entries()
            .get(&handle.uuid)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidHandle(format!("unknown handle {}", handle)))?;

        if entry.owner != principal.username {
            return Err(GatewayError::InvalidHandle(format!(
                "unknown handle {}",
                handle
            )));
        }
        if let Some(mode) = mode {
            if entry.mode != mode {
                let wanted = match mode {
                    HandleMode::Read => "reading",
                    HandleMode::Write => "writing",
                };
                return Err(GatewayError::InvalidHandle(format!(
                    "handle {} is not open for {}",
                    handle, wanted
                )));
            }
        }

        Ok(entry)
    }

    /// Removes the entry for `id`, but only if it is still `entry`.
    fn retire(&self, id: Uuid, entry: &Arc<HandleEntry>) {
        let mut entries = self.write_entries();
        if entries.get(&id).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(&id);
        }
    }
}
