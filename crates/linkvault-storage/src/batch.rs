use linkvault_core::{BatchItem, BatchLink, RepositoryError, ShortCode};
use std::collections::{HashMap, HashSet};

/// A row a batch will insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewLink {
    pub code: ShortCode,
    pub original_url: String,
}

/// Decision taken for a batch before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchPlan {
    /// Every item can be stored. `rows` holds one row per distinct URL.
    Insert {
        links: Vec<BatchLink>,
        rows: Vec<NewLink>,
    },
    /// Some URLs already have live mappings; nothing may be stored.
    Conflict {
        links: Vec<BatchLink>,
        conflicts: Vec<BatchLink>,
    },
    /// Some item ran out of free candidate codes.
    Exhausted,
}

impl BatchPlan {
    /// Turns a non-insert plan into the error reported to callers.
    pub fn into_error(self) -> Option<RepositoryError> {
        match self {
            BatchPlan::Insert { .. } => None,
            BatchPlan::Conflict { links, conflicts } => {
                Some(RepositoryError::BatchAlreadyExists { links, conflicts })
            }
            BatchPlan::Exhausted => Some(RepositoryError::MaxRetriesExceeded),
        }
    }
}

/// Assigns codes to batch items.
///
/// `live_code` returns the code of an existing live mapping for a URL,
/// `is_taken` reports whether a code is used by any record, live or deleted.
/// Repeated URLs inside one batch share a single code and a single row.
/// A missing candidate list is treated as empty.
pub(crate) fn plan_batch(
    items: &[BatchItem],
    candidates: &[Vec<ShortCode>],
    live_code: impl Fn(&str) -> Option<ShortCode>,
    is_taken: impl Fn(&ShortCode) -> bool,
) -> BatchPlan {
    let mut links = Vec::with_capacity(items.len());
    let mut conflicts = Vec::new();
    let mut rows = Vec::new();
    let mut assigned: HashMap<&str, ShortCode> = HashMap::new();
    let mut used: HashSet<&ShortCode> = HashSet::new();
    let mut exhausted = false;

    for (index, item) in items.iter().enumerate() {
        let url = item.original_url.as_str();

        if let Some(existing) = live_code(url) {
            conflicts.push(BatchLink {
                correlation_id: item.correlation_id.clone(),
                code: existing,
            });
            continue;
        }

        if let Some(code) = assigned.get(url) {
            links.push(BatchLink {
                correlation_id: item.correlation_id.clone(),
                code: code.clone(),
            });
            continue;
        }

        let free = candidates
            .get(index)
            .into_iter()
            .flatten()
            .find(|code| !used.contains(*code) && !is_taken(*code));

        let Some(code) = free else {
            exhausted = true;
            continue;
        };

        used.insert(code);
        assigned.insert(url, code.clone());
        links.push(BatchLink {
            correlation_id: item.correlation_id.clone(),
            code: code.clone(),
        });
        rows.push(NewLink {
            code: code.clone(),
            original_url: item.original_url.clone(),
        });
    }

    if !conflicts.is_empty() {
        BatchPlan::Conflict { links, conflicts }
    } else if exhausted {
        BatchPlan::Exhausted
    } else {
        BatchPlan::Insert { links, rows }
    }
}
