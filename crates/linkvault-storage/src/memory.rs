use crate::batch::{plan_batch, BatchPlan};
use crate::log::{LinkLog, LinkLogError, LogEntry};
use async_trait::async_trait;
use linkvault_core::{
    BatchItem, BatchLink, LinkRecord, LinkRepository, OwnedLink, OwnerId, RepositoryError,
    Result, ShortCode,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, trace};

/// In-memory storage entry for a URL mapping.
#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    original_url: String,
    owner: OwnerId,
    deleted: bool,
}

impl Entry {
    fn to_log_entry(&self, code: &ShortCode) -> LogEntry {
        LogEntry {
            id: self.id,
            short_url: code.to_string(),
            original_url: self.original_url.clone(),
            owner_id: Some(self.owner.to_string()),
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    links: HashMap<ShortCode, Entry>,
    /// Reverse index over live entries only.
    live_urls: HashMap<String, ShortCode>,
    last_id: u64,
    log: Option<LinkLog>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Writes entries to the log, if any. Must succeed before state changes.
    fn persist(&mut self, entries: &[LogEntry]) -> Result<()> {
        match self.log.as_mut() {
            Some(log) => log
                .append(entries)
                .map_err(|e| RepositoryError::Persistence(e.to_string())),
            None => Ok(()),
        }
    }

    fn insert(&mut self, code: ShortCode, entry: Entry) {
        if !entry.deleted {
            self.live_urls.insert(entry.original_url.clone(), code.clone());
        }
        self.last_id = self.last_id.max(entry.id);
        self.links.insert(code, entry);
    }

    /// Applies one replayed log line.
    fn replay(&mut self, line: usize, logged: LogEntry) -> std::result::Result<(), LinkLogError> {
        let code = ShortCode::new_unchecked(logged.short_url);

        if let Some(existing) = self.links.get_mut(&code) {
            // A deletion line repeats an earlier record of the same code.
            if logged.deleted && existing.original_url == logged.original_url {
                if !existing.deleted {
                    existing.deleted = true;
                    self.live_urls.remove(&logged.original_url);
                }
                return Ok(());
            }
            return Err(LinkLogError::DuplicateCode {
                line,
                code: code.to_string(),
            });
        }

        if !logged.deleted && self.live_urls.contains_key(&logged.original_url) {
            return Err(LinkLogError::DuplicateUrl {
                line,
                url: logged.original_url,
            });
        }

        self.insert(
            code,
            Entry {
                id: logged.id,
                original_url: logged.original_url,
                owner: OwnerId::new(logged.owner_id.unwrap_or_default()),
                deleted: logged.deleted,
            },
        );
        Ok(())
    }
}

/// In-memory implementation of [`LinkRepository`], optionally mirrored to an
/// append-only [`LinkLog`].
///
/// A single mutex guards both the code index and the reverse URL index for
/// the whole of every operation, so all operations are linearizable. The
/// file-backed variant appends to the log while holding the lock and only
/// applies a mutation once the append succeeded.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    /// Creates a new in-memory repository without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a file-backed repository, replaying the log at `path`.
    ///
    /// A log that maps one code twice or gives one URL two live codes is
    /// corrupt and fails the open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, entries) =
            LinkLog::open(path).map_err(|e| RepositoryError::Persistence(e.to_string()))?;

        let mut state = State::default();
        let replayed = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            state
                .replay(index + 1, entry)
                .map_err(|e| RepositoryError::Persistence(e.to_string()))?;
        }

        info!(
            path = %log.path().display(),
            replayed,
            links = state.links.len(),
            live = state.live_urls.len(),
            "replayed link log"
        );

        state.log = Some(log);
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Returns a copy of the record stored under `code`, deleted or not.
    pub fn record(&self, code: &ShortCode) -> Option<LinkRecord> {
        let state = self.state.lock();
        state.links.get(code).map(|entry| LinkRecord {
            code: code.clone(),
            original_url: entry.original_url.clone(),
            owner: entry.owner.clone(),
            deleted: entry.deleted,
        })
    }

    /// Number of records, including deleted ones.
    pub fn len(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LinkRepository for InMemoryRepository {
    async fn get_original_url(&self, code: &ShortCode) -> Result<String> {
        trace!(code = %code, "resolving short code");

        let state = self.state.lock();
        match state.links.get(code) {
            None => Err(RepositoryError::NotFound(code.to_string())),
            Some(entry) if entry.deleted => Err(RepositoryError::Deleted(code.to_string())),
            Some(entry) => Ok(entry.original_url.clone()),
        }
    }

    async fn create_link(
        &self,
        original_url: &str,
        candidates: &[ShortCode],
        owner: &OwnerId,
    ) -> Result<ShortCode> {
        let mut state = self.state.lock();

        if let Some(existing) = state.live_urls.get(original_url) {
            return Err(RepositoryError::AlreadyExists(existing.clone()));
        }

        let code = candidates
            .iter()
            .find(|code| !state.links.contains_key(*code))
            .cloned()
            .ok_or(RepositoryError::MaxRetriesExceeded)?;

        let entry = Entry {
            id: state.next_id(),
            original_url: original_url.to_string(),
            owner: owner.clone(),
            deleted: false,
        };
        state.persist(&[entry.to_log_entry(&code)])?;
        state.insert(code.clone(), entry);

        debug!(code = %code, owner = %owner, "created link");
        Ok(code)
    }

    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        candidates: &[Vec<ShortCode>],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>> {
        let mut state = self.state.lock();

        let plan = plan_batch(
            items,
            candidates,
            |url| state.live_urls.get(url).cloned(),
            |code| state.links.contains_key(code),
        );

        let (links, rows) = match plan {
            BatchPlan::Insert { links, rows } => (links, rows),
            other => return Err(other.into_error().unwrap_or(RepositoryError::MaxRetriesExceeded)),
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = Entry {
                id: state.next_id(),
                original_url: row.original_url,
                owner: owner.clone(),
                deleted: false,
            };
            entries.push((row.code, entry));
        }

        let logged: Vec<_> = entries
            .iter()
            .map(|(code, entry)| entry.to_log_entry(code))
            .collect();
        if let Err(err) = state.persist(&logged) {
            // Nothing was applied; hand the reserved ids back.
            state.last_id -= entries.len() as u64;
            return Err(err);
        }

        let stored = entries.len();
        for (code, entry) in entries {
            state.insert(code, entry);
        }

        debug!(owner = %owner, items = items.len(), stored, "created link batch");
        Ok(links)
    }

    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>> {
        let state = self.state.lock();

        let mut owned: Vec<_> = state
            .links
            .iter()
            .filter(|(_, entry)| !entry.deleted && &entry.owner == owner)
            .map(|(code, entry)| (entry.id, code, entry))
            .collect();
        owned.sort_by_key(|(id, _, _)| *id);

        Ok(owned
            .into_iter()
            .map(|(_, code, entry)| OwnedLink {
                code: code.clone(),
                original_url: entry.original_url.clone(),
            })
            .collect())
    }

    async fn soft_delete(&self, codes: &[ShortCode], owner: &OwnerId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut doomed: Vec<ShortCode> = Vec::new();
        for code in codes {
            let owned_and_live = state
                .links
                .get(code)
                .is_some_and(|entry| !entry.deleted && &entry.owner == owner);
            if owned_and_live && !doomed.contains(code) {
                doomed.push(code.clone());
            }
        }

        if doomed.is_empty() {
            trace!(owner = %owner, requested = codes.len(), "nothing to delete");
            return Ok(());
        }

        let logged: Vec<_> = doomed
            .iter()
            .filter_map(|code| {
                state.links.get(code).map(|entry| {
                    let mut line = entry.to_log_entry(code);
                    line.deleted = true;
                    line
                })
            })
            .collect();
        state.persist(&logged)?;

        for code in &doomed {
            if let Some(entry) = state.links.get_mut(code) {
                entry.deleted = true;
                let url = entry.original_url.clone();
                state.live_urls.remove(&url);
            }
        }

        debug!(owner = %owner, requested = codes.len(), deleted = doomed.len(), "soft-deleted links");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Err(RepositoryError::Unavailable(
            "in-memory storage has no durable backend".to_string(),
        ))
    }
}
