//! The single consumer that owns all mutable block store state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, instrument, trace, warn};

use super::Shared;
use crate::{BlockId, BlockMetadata, BlockStatus, ReferenceCallback, Result, StorageError};

pub(super) type Reply<T> = Sender<Result<T>>;

pub(super) enum Job {
    /// Store `data` unless the block exists; optionally add a reference
    /// and pin it for a handle.
    ReferOrStore {
        id: BlockId,
        status: BlockStatus,
        data: Arc<Vec<u8>>,
        refer: bool,
        pin: bool,
        reply: Reply<BlockStatus>,
    },
    UpdateRefCount {
        id: BlockId,
        delta: i64,
        reply: Reply<()>,
    },
    /// Pin a block in memory; replies with its status if it exists
    Pin {
        id: BlockId,
        reply: Option<Reply<Option<BlockStatus>>>,
    },
    Unpin {
        id: BlockId,
    },
    SetStatus {
        id: BlockId,
        status: BlockStatus,
        reply: Reply<()>,
    },
    GetName {
        name: String,
        reply: Reply<Option<BlockId>>,
    },
    SetName {
        name: String,
        id: Option<BlockId>,
    },
    Flush {
        reply: Reply<usize>,
    },
    Quit,
}

struct Entry {
    meta: BlockMetadata,
    /// Metadata as persisted; `None` while the backend lacks the block
    stored: Option<BlockMetadata>,
    dirty: bool,
    /// In-memory pins from handles and callers
    storage_refs: usize,
}

/// Staged name change: (persisted value, wanted value)
type NameState = (Option<BlockId>, Option<BlockId>);

pub(super) struct Worker {
    shared: Arc<Shared>,
    callback: Option<ReferenceCallback>,
    entries: HashMap<BlockId, Entry>,
    dirty: HashSet<BlockId>,
    names: HashMap<String, NameState>,
}

impl Worker {
    pub fn new(shared: Arc<Shared>, callback: Option<ReferenceCallback>) -> Self {
        Self {
            shared,
            callback,
            entries: HashMap::new(),
            dirty: HashSet::new(),
            names: HashMap::new(),
        }
    }

    pub fn run(mut self, jobs: Receiver<Job>) {
        debug!("block store worker started");
        for job in jobs {
            match job {
                Job::ReferOrStore {
                    id,
                    status,
                    data,
                    refer,
                    pin,
                    reply,
                } => {
                    let result = self.refer_or_store(id, status, data, refer, pin);
                    self.reply(reply, result);
                }
                Job::UpdateRefCount { id, delta, reply } => {
                    let result = self.update_ref_counts(vec![(id, delta)]);
                    self.reply(reply, result);
                }
                Job::Pin { id, reply } => {
                    let result = self.pin(&id);
                    match reply {
                        Some(reply) => self.reply(reply, result),
                        None => {
                            if let Err(err) = result {
                                warn!(%id, error = %err, "pinning block failed");
                            }
                        }
                    }
                }
                Job::Unpin { id } => self.unpin(&id),
                Job::SetStatus { id, status, reply } => {
                    let result = self.set_status(&id, status);
                    self.reply(reply, result);
                }
                Job::GetName { name, reply } => {
                    let result = self.get_name(&name);
                    self.reply(reply, result);
                }
                Job::SetName { name, id } => {
                    if let Err(err) = self.set_name(name, id) {
                        warn!(error = %err, "staging name failed");
                    }
                }
                Job::Flush { reply } => {
                    let result = self.flush();
                    self.reply(reply, result);
                }
                Job::Quit => break,
            }
        }
        debug!(blocks = self.entries.len(), "block store worker stopped");
    }

    /// Publish counters, then answer the caller
    fn reply<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.shared
            .stats
            .set_counts(self.entries.len(), self.dirty.len());
        // The caller may have given up waiting
        let _ = reply.send(result);
    }

    /// Load the entry for `id` from the backend if it is not resident
    fn load(&mut self, id: &BlockId) -> Result<bool> {
        if self.entries.contains_key(id) {
            return Ok(true);
        }
        match self.shared.backend.get_block_by_id(id)? {
            Some(meta) => {
                self.entries.insert(
                    id.clone(),
                    Entry {
                        meta,
                        stored: Some(meta),
                        dirty: false,
                        storage_refs: 0,
                    },
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn meta(&self, id: &BlockId) -> Result<BlockMetadata> {
        self.entries
            .get(id)
            .map(|e| e.meta)
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })
    }

    fn mark_dirty(&mut self, id: &BlockId) {
        if let Some(entry) = self.entries.get_mut(id) {
            if !entry.dirty {
                entry.dirty = true;
                self.dirty.insert(id.clone());
            }
        }
    }

    /// Drop an entry nobody needs any more
    fn maybe_evict(&mut self, id: &BlockId) {
        let idle = self
            .entries
            .get(id)
            .is_some_and(|e| e.storage_refs == 0 && !e.dirty);
        if idle {
            self.entries.remove(id);
            self.shared.cache.remove(id);
            trace!(%id, "evicted block");
        }
    }

    #[instrument(skip(self, data), level = "debug")]
    fn refer_or_store(
        &mut self,
        id: BlockId,
        status: BlockStatus,
        data: Arc<Vec<u8>>,
        refer: bool,
        pin: bool,
    ) -> Result<BlockStatus> {
        if self.load(&id)? {
            // A weak copy gets upgraded by a stronger store
            let existing = self.meta(&id)?.status;
            if existing.is_weak() && !status.is_weak() {
                self.set_status(&id, status)?;
            }
            if self.entries.get(&id).is_some_and(|e| e.stored.is_none()) {
                // Deleted while pinned; the fresh payload is authoritative
                self.shared.cache.insert(id.clone(), data);
            }
        } else {
            self.shared.cache.insert(id.clone(), data);
            self.entries.insert(
                id.clone(),
                Entry {
                    meta: BlockMetadata::new(0, status),
                    stored: None,
                    dirty: false,
                    storage_refs: 0,
                },
            );
            self.mark_dirty(&id);
        }
        if refer {
            self.update_ref_counts(vec![(id.clone(), 1)])?;
        }
        if pin {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.storage_refs += 1;
            }
        }
        let status = self.meta(&id)?.status;
        self.maybe_evict(&id);
        Ok(status)
    }

    fn pin(&mut self, id: &BlockId) -> Result<Option<BlockStatus>> {
        if !self.load(id)? {
            return Ok(None);
        }
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })?;
        entry.storage_refs += 1;
        Ok(Some(entry.meta.status))
    }

    fn unpin(&mut self, id: &BlockId) {
        match self.entries.get_mut(id) {
            Some(entry) if entry.storage_refs > 0 => entry.storage_refs -= 1,
            _ => {
                warn!(%id, "unpinning a block that is not pinned");
                return;
            }
        }
        self.maybe_evict(id);
    }

    /// Apply refcount deltas, cascading into payload references whenever
    /// a block's references switch between active and inactive.
    fn update_ref_counts(&mut self, mut work: Vec<(BlockId, i64)>) -> Result<()> {
        while let Some((id, delta)) = work.pop() {
            if !self.load(&id)? {
                return Err(StorageError::MissingBlock { id });
            }
            self.mark_dirty(&id);
            let entry = self
                .entries
                .get_mut(&id)
                .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })?;
            let before = entry.meta.references_active();
            entry.meta.ref_count = entry
                .meta
                .ref_count
                .checked_add_signed(delta)
                .ok_or_else(|| {
                    StorageError::Corrupt(format!("refcount of {id} would become negative"))
                })?;
            let after = entry.meta.references_active();
            trace!(%id, delta, ref_count = entry.meta.ref_count, "refcount changed");
            if before != after {
                let child_delta = if after { 1 } else { -1 };
                for child in self.references(&id)? {
                    work.push((child, child_delta));
                }
            }
        }
        Ok(())
    }

    fn set_status(&mut self, id: &BlockId, status: BlockStatus) -> Result<()> {
        if !self.load(id)? {
            return Err(StorageError::MissingBlock { id: id.clone() });
        }
        self.mark_dirty(id);
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })?;
        let before = entry.meta.references_active();
        entry.meta.status = status;
        let after = entry.meta.references_active();
        if before != after {
            let delta = if after { 1 } else { -1 };
            let work = self
                .references(id)?
                .into_iter()
                .map(|child| (child, delta))
                .collect();
            self.update_ref_counts(work)?;
        }
        Ok(())
    }

    /// Ids mentioned by the payload of `id`
    fn references(&self, id: &BlockId) -> Result<Vec<BlockId>> {
        let Some(callback) = &self.callback else {
            return Ok(Vec::new());
        };
        let data = match self.shared.cache.get(id) {
            Some(data) => data.clone(),
            None => match self.shared.backend.get_block_data(id)? {
                Some(data) => Arc::new(data),
                None => {
                    debug!(%id, "no data; references not followed");
                    return Ok(Vec::new());
                }
            },
        };
        let mut out = Vec::new();
        callback(id, &data, &mut |child| out.push(child));
        Ok(out)
    }

    fn get_name(&mut self, name: &str) -> Result<Option<BlockId>> {
        if let Some((_, wanted)) = self.names.get(name) {
            return Ok(wanted.clone());
        }
        let current = self.shared.backend.get_name(name)?;
        self.names
            .insert(name.to_string(), (current.clone(), current.clone()));
        Ok(current)
    }

    fn set_name(&mut self, name: String, id: Option<BlockId>) -> Result<()> {
        if !self.names.contains_key(&name) {
            let current = self.shared.backend.get_name(&name)?;
            self.names.insert(name.clone(), (current.clone(), current));
        }
        if let Some(state) = self.names.get_mut(&name) {
            state.1 = id;
        }
        Ok(())
    }

    fn flush_names(&mut self) -> Result<usize> {
        let changed: Vec<(String, NameState)> = self
            .names
            .iter()
            .filter(|(_, (old, new))| old != new)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, (old, new)) in &changed {
            debug!(name, "publishing name");
            self.shared.backend.set_name(name, new.as_ref())?;
            // Popped from the back: the new value's references land first
            let mut work = Vec::new();
            if let Some(old) = old {
                work.push((old.clone(), -1));
            }
            if let Some(new) = new {
                work.push((new.clone(), 1));
            }
            self.update_ref_counts(work)?;
            if let Some(state) = self.names.get_mut(name) {
                state.0 = new.clone();
            }
        }
        Ok(changed.len())
    }

    /// Write one entry through; it stays dirty unless the backend accepted it
    fn flush_entry(&mut self, id: &BlockId) -> Result<usize> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Ok(0);
        };
        let backend = &self.shared.backend;
        let ops = if entry.meta.ref_count == 0 {
            if entry.stored.is_some() {
                if entry.storage_refs > 0 && !self.shared.cache.contains_key(id) {
                    // Keep data readable for handles that outlive the block
                    if let Some(data) = backend.get_block_data(id)? {
                        self.shared.cache.insert(id.clone(), Arc::new(data));
                    }
                }
                backend.delete_block(id)?;
                entry.stored = None;
                trace!(%id, "deleted block");
                1
            } else {
                0
            }
        } else {
            match entry.stored {
                None => {
                    let data = self
                        .shared
                        .cache
                        .get(id)
                        .map(|d| d.clone())
                        .unwrap_or_default();
                    backend.store_block(id, entry.meta, &data)?;
                    self.shared.stats.record_write(data.len());
                    entry.stored = Some(entry.meta);
                    1
                }
                Some(stored) if stored != entry.meta => {
                    let ops = backend.update_block(id, entry.meta)?;
                    entry.stored = Some(entry.meta);
                    ops
                }
                Some(_) => 0,
            }
        };
        entry.dirty = false;
        Ok(ops)
    }

    #[instrument(skip(self), level = "debug")]
    fn flush(&mut self) -> Result<usize> {
        self.shared.backend.set_in_flush(true);
        let result = self.flush_inner();
        self.shared.backend.set_in_flush(false);
        result
    }

    fn flush_inner(&mut self) -> Result<usize> {
        let mut ops = self.flush_names()?;

        while !self.dirty.is_empty() {
            // Stores first: they may add references that deletes rely on
            let (live, dead): (Vec<BlockId>, Vec<BlockId>) = self
                .dirty
                .drain()
                .partition(|id| self.entries.get(id).is_some_and(|e| e.meta.ref_count > 0));
            let ordered: Vec<BlockId> = live.into_iter().chain(dead).collect();
            for (i, id) in ordered.iter().enumerate() {
                match self.flush_entry(id) {
                    Ok(n) => ops += n,
                    Err(err) => {
                        // Retried by the next flush
                        self.dirty.extend(ordered[i..].iter().cloned());
                        return Err(err);
                    }
                }
            }
        }

        let idle: Vec<BlockId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.storage_refs == 0 && !e.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            self.maybe_evict(id);
        }

        self.shared.backend.flush()?;
        let stats = self.shared.stats.take_io();
        info!(
            ops,
            reads = stats.reads,
            read_bytes = stats.read_bytes,
            writes = stats.writes,
            write_bytes = stats.write_bytes,
            blocks = self.entries.len(),
            "block store flushed"
        );
        Ok(ops)
    }
}
