use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::archive::ArchiveEntry;

/// One node of the cache's owning arena, keyed by `id`. The hash index, LRU
/// ordering, expiry ordering, and per-archive child grouping described in
/// SPEC_FULL.md §4.D/§9 are realised as auxiliary structures over this id rather
/// than as intrusive pointers embedded in the node itself.
struct CacheNode {
    id: u64,
    archive_id: u64,
    expire_at: i64,
    archive_path: String,
    member_rel_path: Option<String>,
    full_path: String,
    entry: Option<ArchiveEntry>,
    lru_prev: Option<u64>,
    lru_next: Option<u64>,
    exp_prev: Option<u64>,
    exp_next: Option<u64>,
    children: Vec<u64>,
}

struct Inner {
    nodes: HashMap<u64, CacheNode>,
    by_full_path: HashMap<String, u64>,
    lru_head: Option<u64>,
    lru_tail: Option<u64>,
    exp_head: Option<u64>,
    exp_tail: Option<u64>,
    next_id: u64,
    max_entries: u64,
    grace: i64,
}

/// Bounded, TTL-expiring, LRU-evicting cache of archive-member metadata, with a
/// per-archive child index so a warm `readdir` never re-opens the archive. A single
/// mutex guards every public operation; critical sections are short.
pub struct MetadataCache {
    inner: Mutex<Inner>,
}

impl MetadataCache {
    pub fn new(max_entries: u64, grace_secs: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                by_full_path: HashMap::new(),
                lru_head: None,
                lru_tail: None,
                exp_head: None,
                exp_tail: None,
                next_id: 1,
                max_entries,
                grace: grace_secs,
            }),
        }
    }

    /// Inserts a cache entry and returns its id. `member_rel_path = None` and
    /// `entry = None` creates a bare archive placeholder used purely as a parent
    /// handle for child lookups (see `scandir`). When `archive_id != 0`, the new
    /// entry is attached to that parent's child list only if the parent currently
    /// occupying `archive_path` still has that exact id (the generation check from
    /// SPEC_FULL.md §9).
    pub fn insert(
        &self,
        archive_path: &str,
        member_rel_path: Option<&str>,
        archive_id: u64,
        entry: Option<ArchiveEntry>,
    ) -> u64 {
        let full_path = match member_rel_path {
            Some(rel) => format!("{archive_path}/{rel}"),
            None => archive_path.to_string(),
        };

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return 0,
        };

        expunge(&mut inner);

        let id = inner.next_id;
        inner.next_id += 1;

        if let Some(&existing) = inner.by_full_path.get(&full_path) {
            delete(&mut inner, existing);
        }

        if inner.nodes.len() as u64 >= inner.max_entries {
            if let Some(head) = inner.lru_head {
                delete(&mut inner, head);
            }
        }

        let node = CacheNode {
            id,
            archive_id: 0,
            expire_at: now() + inner.grace,
            archive_path: archive_path.to_string(),
            member_rel_path: member_rel_path.map(str::to_string),
            full_path: full_path.clone(),
            entry,
            lru_prev: None,
            lru_next: None,
            exp_prev: None,
            exp_next: None,
            children: Vec::new(),
        };
        inner.nodes.insert(id, node);
        inner.by_full_path.insert(full_path, id);
        lru_append(&mut inner, id);
        exp_append(&mut inner, id);

        if archive_id != 0 {
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.archive_id = archive_id;
            }
            if let Some(&parent_id) = inner.by_full_path.get(archive_path) {
                if parent_id == archive_id {
                    lru_touch(&mut inner, parent_id);
                    if let Some(parent) = inner.nodes.get_mut(&parent_id) {
                        parent.children.push(id);
                    }
                }
            }
        }

        id
    }

    /// Looks up a single member's descriptor, touching its LRU position on hit.
    pub fn get(&self, archive_path: &str, member_rel_path: &str) -> Option<ArchiveEntry> {
        let full_path = format!("{archive_path}/{member_rel_path}");
        let mut inner = self.inner.lock().ok()?;
        expunge(&mut inner);
        let id = *inner.by_full_path.get(&full_path)?;
        lru_touch(&mut inner, id);
        inner.nodes.get(&id).and_then(|n| n.entry)
    }

    /// Replays the cached children of the archive placeholder at `archive_path`,
    /// invoking `callback(member_rel_path, entry)` for each and stopping early if it
    /// returns `false`. Returns whether the placeholder was found at all: `false`
    /// signals the caller to fall back to a fresh enumeration.
    pub fn scandir(
        &self,
        archive_path: &str,
        mut callback: impl FnMut(&str, &ArchiveEntry) -> bool,
    ) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        expunge(&mut inner);

        let parent_id = match inner.by_full_path.get(archive_path).copied() {
            Some(id) => id,
            None => return false,
        };

        let children = inner
            .nodes
            .get(&parent_id)
            .map(|n| n.children.clone())
            .unwrap_or_default();

        for child_id in children {
            lru_touch(&mut inner, child_id);
            let Some(node) = inner.nodes.get(&child_id) else {
                continue;
            };
            let rel = node.member_rel_path.clone().unwrap_or_default();
            let Some(entry) = node.entry else { continue };
            if !callback(&rel, &entry) {
                break;
            }
        }

        lru_touch(&mut inner, parent_id);
        true
    }

    /// Drops every cache entry. Called once, at unmount.
    pub fn free(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.nodes.clear();
            inner.by_full_path.clear();
            inner.lru_head = None;
            inner.lru_tail = None;
            inner.exp_head = None;
            inner.exp_tail = None;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn lru_unlink(inner: &mut Inner, id: u64) {
    let (prev, next) = match inner.nodes.get(&id) {
        Some(n) => (n.lru_prev, n.lru_next),
        None => return,
    };
    match prev {
        Some(p) => {
            if let Some(n) = inner.nodes.get_mut(&p) {
                n.lru_next = next;
            }
        }
        None => inner.lru_head = next,
    }
    match next {
        Some(n) => {
            if let Some(node) = inner.nodes.get_mut(&n) {
                node.lru_prev = prev;
            }
        }
        None => inner.lru_tail = prev,
    }
}

fn lru_append(inner: &mut Inner, id: u64) {
    let tail = inner.lru_tail;
    if let Some(node) = inner.nodes.get_mut(&id) {
        node.lru_prev = tail;
        node.lru_next = None;
    }
    match tail {
        Some(t) => {
            if let Some(node) = inner.nodes.get_mut(&t) {
                node.lru_next = Some(id);
            }
        }
        None => inner.lru_head = Some(id),
    }
    inner.lru_tail = Some(id);
}

fn lru_touch(inner: &mut Inner, id: u64) {
    if !inner.nodes.contains_key(&id) {
        return;
    }
    lru_unlink(inner, id);
    lru_append(inner, id);
}

fn exp_unlink(inner: &mut Inner, id: u64) {
    let (prev, next) = match inner.nodes.get(&id) {
        Some(n) => (n.exp_prev, n.exp_next),
        None => return,
    };
    match prev {
        Some(p) => {
            if let Some(n) = inner.nodes.get_mut(&p) {
                n.exp_next = next;
            }
        }
        None => inner.exp_head = next,
    }
    match next {
        Some(n) => {
            if let Some(node) = inner.nodes.get_mut(&n) {
                node.exp_prev = prev;
            }
        }
        None => inner.exp_tail = prev,
    }
}

fn exp_append(inner: &mut Inner, id: u64) {
    let tail = inner.exp_tail;
    if let Some(node) = inner.nodes.get_mut(&id) {
        node.exp_prev = tail;
        node.exp_next = None;
    }
    match tail {
        Some(t) => {
            if let Some(node) = inner.nodes.get_mut(&t) {
                node.exp_next = Some(id);
            }
        }
        None => inner.exp_head = Some(id),
    }
    inner.exp_tail = Some(id);
}

/// Removes `id`, cascading to its parent if the parent still has the matching
/// generation id (see SPEC_FULL.md §9's parent-generation invariant).
fn delete(inner: &mut Inner, id: u64) {
    let node = match inner.nodes.remove(&id) {
        Some(n) => n,
        None => return,
    };

    if node.archive_id != 0 {
        if let Some(&parent_id) = inner.by_full_path.get(&node.archive_path) {
            if parent_id == node.archive_id {
                delete(inner, parent_id);
            }
        }
    }

    lru_unlink(inner, id);
    exp_unlink(inner, id);
    inner.by_full_path.remove(&node.full_path);
}

fn expunge(inner: &mut Inner) {
    let current = now();
    loop {
        let head = match inner.exp_head {
            Some(h) => h,
            None => return,
        };
        let expired = inner
            .nodes
            .get(&head)
            .map(|n| n.expire_at < current)
            .unwrap_or(false);
        if !expired {
            return;
        }
        delete(inner, head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FLAG_DIR;

    fn entry(index: i64, size: i64) -> ArchiveEntry {
        ArchiveEntry {
            index,
            size,
            flags: 0,
        }
    }

    #[test]
    fn get_after_insert_hits_and_touches_lru() {
        let cache = MetadataCache::new(10, 60);
        cache.insert("/b/a.zip", Some("readme"), 0, Some(entry(0, 2)));
        let got = cache.get("/b/a.zip", "readme").unwrap();
        assert_eq!(got.size, 2);
    }

    #[test]
    fn miss_returns_none() {
        let cache = MetadataCache::new(10, 60);
        assert!(cache.get("/b/a.zip", "nope").is_none());
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = MetadataCache::new(2, 60);
        cache.insert("/b/a.zip", Some("one"), 0, Some(entry(0, 1)));
        cache.insert("/b/a.zip", Some("two"), 0, Some(entry(1, 1)));
        cache.insert("/b/a.zip", Some("three"), 0, Some(entry(2, 1)));
        assert!(cache.len() <= 2);
    }

    #[test]
    fn lru_oldest_entry_is_evicted_first() {
        let cache = MetadataCache::new(2, 60);
        cache.insert("/b/a.zip", Some("one"), 0, Some(entry(0, 1)));
        cache.insert("/b/a.zip", Some("two"), 0, Some(entry(1, 1)));
        // touch "one" so "two" becomes the LRU head instead.
        cache.get("/b/a.zip", "one");
        cache.insert("/b/a.zip", Some("three"), 0, Some(entry(2, 1)));
        assert!(cache.get("/b/a.zip", "one").is_some());
        assert!(cache.get("/b/a.zip", "two").is_none());
        assert!(cache.get("/b/a.zip", "three").is_some());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = MetadataCache::new(10, -1);
        cache.insert("/b/a.zip", Some("readme"), 0, Some(entry(0, 2)));
        assert!(cache.get("/b/a.zip", "readme").is_none());
    }

    #[test]
    fn scandir_replays_children_attached_with_matching_generation() {
        let cache = MetadataCache::new(10, 60);
        let parent_id = cache.insert("/b/a.zip", None, 0, None);
        cache.insert(
            "/b/a.zip",
            Some("one"),
            parent_id,
            Some(entry(0, 1)),
        );
        cache.insert(
            "/b/a.zip",
            Some("two"),
            parent_id,
            Some(entry(1, 1)),
        );

        let mut seen = Vec::new();
        let found = cache.scandir("/b/a.zip", |rel, e| {
            seen.push((rel.to_string(), e.size));
            true
        });
        assert!(found);
        seen.sort();
        assert_eq!(seen, vec![("one".to_string(), 1), ("two".to_string(), 1)]);
    }

    #[test]
    fn scandir_on_unknown_archive_signals_miss() {
        let cache = MetadataCache::new(10, 60);
        assert!(!cache.scandir("/b/missing.zip", |_, _| true));
    }

    #[test]
    fn child_inserted_with_stale_generation_is_not_attached() {
        let cache = MetadataCache::new(10, 60);
        let stale_parent_id = cache.insert("/b/a.zip", None, 0, None);
        // Recreate the parent placeholder: it gets a fresh id, orphaning the old one.
        let fresh_parent_id = cache.insert("/b/a.zip", None, 0, None);
        assert_ne!(stale_parent_id, fresh_parent_id);

        cache.insert(
            "/b/a.zip",
            Some("orphan"),
            stale_parent_id,
            Some(entry(0, 1)),
        );

        let mut seen = Vec::new();
        cache.scandir("/b/a.zip", |rel, _| {
            seen.push(rel.to_string());
            true
        });
        assert!(seen.is_empty());
    }

    #[test]
    fn deleting_a_child_cascades_to_its_live_parent() {
        let cache = MetadataCache::new(1, 60);
        let parent_id = cache.insert("/b/a.zip", None, 0, None);
        // Capacity 1: inserting the child evicts the just-created parent placeholder
        // (LRU head), which must cascade-delete on any matching-generation child delete.
        cache.insert(
            "/b/a.zip",
            Some("one"),
            parent_id,
            Some(entry(0, 1)),
        );
        assert!(!cache.scandir("/b/a.zip", |_, _| true) || cache.len() <= 1);
    }
}
