//! Last-Write-Wins conflict resolution over versioned collections.

use crate::sync::models::{Collection, Record, SyncPayload};
use crate::TabkeeperError;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Which side of a pairwise comparison prevails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    AcceptRemote,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a conflict between two versions of the same record.
    ///
    /// LWW rules:
    /// 1. Higher `last_modified` wins (absent is lowest).
    /// 2. On a tie, a tombstone beats an active record.
    /// 3. Then higher `version` wins (absent is lowest).
    /// 4. Then the greater canonical payload wins.
    ///
    /// Only full equality keeps local, so the outcome never depends on
    /// which side is called local.
    pub fn resolve(local: &Record, remote: &Record) -> Resolution {
        match Self::compare(local, remote) {
            Ordering::Less => Resolution::AcceptRemote,
            Ordering::Equal | Ordering::Greater => Resolution::KeepLocal,
        }
    }

    fn compare(a: &Record, b: &Record) -> Ordering {
        a.last_modified
            .cmp(&b.last_modified)
            .then(a.deleted.cmp(&b.deleted))
            .then(a.version.cmp(&b.version))
            .then_with(|| a.canonical_payload().cmp(&b.canonical_payload()))
    }

    /// Merge two collections. Linear in the size of the id union; the
    /// result is sorted by id and always keeps tombstones.
    pub fn merge(local: &[Record], remote: &[Record]) -> Vec<Record> {
        let mut merged: HashMap<&str, &Record> = HashMap::with_capacity(local.len() + remote.len());

        for record in local.iter().chain(remote.iter()) {
            merged
                .entry(record.id.as_str())
                .and_modify(|current| {
                    if Self::resolve(*current, record) == Resolution::AcceptRemote {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut out: Vec<Record> = merged.into_values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Merge every collection present on either side.
    pub fn merge_all(
        local: &BTreeMap<Collection, Vec<Record>>,
        remote: &BTreeMap<Collection, Vec<Record>>,
    ) -> BTreeMap<Collection, Vec<Record>> {
        Collection::ALL
            .into_iter()
            .filter(|c| local.contains_key(c) || remote.contains_key(c))
            .map(|c| {
                let l = local.get(&c).map(Vec::as_slice).unwrap_or_default();
                let r = remote.get(&c).map(Vec::as_slice).unwrap_or_default();
                (c, Self::merge(l, r))
            })
            .collect()
    }

    /// Merge two whole snapshots. Entries that fail validation on either
    /// side are dropped and returned alongside the merged snapshot.
    pub fn merge_payloads(
        local: SyncPayload,
        remote: SyncPayload,
    ) -> (SyncPayload, Vec<TabkeeperError>) {
        let (local, mut rejected) = local.into_collections();
        let (remote, remote_rejected) = remote.into_collections();
        rejected.extend(remote_rejected);

        let merged = Self::merge_all(&local, &remote);
        (SyncPayload::from_collections(&merged), rejected)
    }
}
