//! Thumbnail cache bookkeeping.
//!
//! - Maps each source image to its thumbnail file, and each thumbnail to the
//!   sources sharing it (identical pixels are stored once)
//! - Bounded by the number of mapped sources; the thumbnail with the fewest
//!   sources is evicted first, least recently used among equals
//! - Thumbnails that a grid renderer is still reading are never deleted right
//!   away: their deletion is deferred until every render of them is done
//!
//! No method touches the filesystem. Methods that make files obsolete return
//! their paths and the caller deletes them (see [`delete_files`]) after the
//! lock is released.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct Linked {
    /// Recency; smaller is older.
    seq: u64,
    sources: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct CacheState {
    by_source: HashMap<PathBuf, PathBuf>,
    by_thumbnail: HashMap<PathBuf, Linked>,
    /// Sources whose thumbnail left the main cache while being rendered.
    extra: HashMap<PathBuf, PathBuf>,
    /// Thumbnail -> sources currently being rendered from it.
    being_rendered: HashMap<PathBuf, HashSet<PathBuf>>,
    /// Thumbnails to delete once no longer being rendered.
    to_be_deleted: HashSet<PathBuf>,
    next_seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn in_flight(&self, thumbnail: &Path) -> bool {
        self.being_rendered.contains_key(thumbnail)
    }

    /// Drop `thumbnail` and its sources, deleting it now or once its renders
    /// are done.
    fn discard(&mut self, thumbnail: PathBuf, delete: &mut Vec<PathBuf>) {
        let Some(linked) = self.by_thumbnail.remove(&thumbnail) else {
            return;
        };
        for source in &linked.sources {
            self.by_source.remove(source);
        }
        if let Some(rendering) = self.being_rendered.get(&thumbnail) {
            for source in rendering {
                self.extra.insert(source.clone(), thumbnail.clone());
            }
            self.to_be_deleted.insert(thumbnail);
        } else {
            delete.push(thumbnail);
        }
    }

    /// Evict one thumbnail. Returns false if there was nothing to evict.
    fn evict_one(&mut self, delete: &mut Vec<PathBuf>) -> bool {
        let victim = self
            .by_thumbnail
            .iter()
            .min_by_key(|(_, linked)| (linked.sources.len(), linked.seq))
            .map(|(thumbnail, _)| thumbnail.clone());
        match victim {
            Some(thumbnail) => {
                trace!(?thumbnail, "Evicting thumbnail");
                self.discard(thumbnail, delete);
                true
            }
            None => false,
        }
    }

    /// Remove `source` from whichever thumbnail it maps to.
    fn unlink_source(&mut self, source: &Path, delete: &mut Vec<PathBuf>) {
        let Some(thumbnail) = self.by_source.remove(source) else {
            return;
        };
        let orphaned = match self.by_thumbnail.get_mut(&thumbnail) {
            Some(linked) => {
                linked.sources.retain(|s| s != source);
                linked.sources.is_empty()
            }
            None => false,
        };
        if orphaned {
            self.discard(thumbnail, delete);
        }
    }
}

/// Shared thumbnail bookkeeping. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    /// Directory the thumbnail files live in.
    dir: PathBuf,
    /// Maximum number of mapped sources; 0 for unbounded.
    max_sources: usize,
    state: Arc<Mutex<CacheState>>,
}

impl ThumbnailCache {
    pub fn new(dir: PathBuf, max_sources: usize) -> Self {
        Self {
            dir,
            max_sources,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Thumbnail of `source`, if cached.
    pub fn get(&self, source: &Path) -> Option<PathBuf> {
        self.state.lock().by_source.get(source).cloned()
    }

    /// Look up `source` and, on a hit, mark its thumbnail as being rendered
    /// for it.
    pub fn acquire(&self, source: &Path) -> Option<PathBuf> {
        let mut state = self.state.lock();
        let thumbnail = state.by_source.get(source)?.clone();
        let seq = state.next_seq();
        if let Some(linked) = state.by_thumbnail.get_mut(&thumbnail) {
            linked.seq = seq;
        }
        state
            .being_rendered
            .entry(thumbnail.clone())
            .or_default()
            .insert(source.to_path_buf());
        Some(thumbnail)
    }

    /// `thumbnail` is about to be rendered for `source`.
    pub fn mark_being_rendered(&self, source: &Path, thumbnail: &Path) {
        self.state
            .lock()
            .being_rendered
            .entry(thumbnail.to_path_buf())
            .or_default()
            .insert(source.to_path_buf());
    }

    /// The render of `thumbnail` for `source` is done (or was abandoned).
    pub fn mark_rendered(&self, source: &Path, thumbnail: &Path) {
        let mut state = self.state.lock();
        if let Some(sources) = state.being_rendered.get_mut(thumbnail) {
            sources.remove(source);
            if sources.is_empty() {
                state.being_rendered.remove(thumbnail);
            }
        }
        state.extra.remove(source);
    }

    /// Whether recording another source would evict something.
    pub fn is_full(&self) -> bool {
        self.max_sources > 0 && self.state.lock().by_source.len() >= self.max_sources
    }

    /// Record a freshly generated `thumbnail` for `source`.
    ///
    /// `deduplicated` is an existing thumbnail with identical pixels that
    /// `thumbnail` was copied from: its sources move over to `thumbnail` and
    /// the old file is retired. Returns files to delete now.
    pub fn record(&self, source: &Path, thumbnail: &Path, deduplicated: Option<&Path>) -> Vec<PathBuf> {
        let mut delete = Vec::new();
        let mut state = self.state.lock();

        state.unlink_source(source, &mut delete);
        if self.max_sources > 0 {
            while state.by_source.len() >= self.max_sources {
                if !state.evict_one(&mut delete) {
                    break;
                }
            }
        }

        let mut sources = Vec::new();
        // The duplicate may just have been evicted; then this is a plain insert.
        if let Some(old) = deduplicated.filter(|d| state.by_thumbnail.contains_key(*d)) {
            if let Some(linked) = state.by_thumbnail.remove(old) {
                for s in &linked.sources {
                    state.by_source.insert(s.clone(), thumbnail.to_path_buf());
                }
                sources = linked.sources;
            }
            if let Some(rendering) = state.being_rendered.get(old).cloned() {
                for s in rendering {
                    state.extra.insert(s, old.to_path_buf());
                }
                state.to_be_deleted.insert(old.to_path_buf());
            } else {
                delete.push(old.to_path_buf());
            }
            debug!(?old, new = ?thumbnail, "Merged duplicate thumbnail");
        }

        sources.push(source.to_path_buf());
        state
            .by_source
            .insert(source.to_path_buf(), thumbnail.to_path_buf());
        let seq = state.next_seq();
        state
            .by_thumbnail
            .insert(thumbnail.to_path_buf(), Linked { seq, sources });

        delete
    }

    /// Deferred deletions whose renders have all finished.
    pub fn take_deletable(&self) -> Vec<PathBuf> {
        let mut state = self.state.lock();
        let ready: Vec<PathBuf> = state
            .to_be_deleted
            .iter()
            .filter(|t| !state.in_flight(t))
            .cloned()
            .collect();
        for thumbnail in &ready {
            state.to_be_deleted.remove(thumbnail);
        }
        ready
    }

    pub fn has_pending_deletions(&self) -> bool {
        !self.state.lock().to_be_deleted.is_empty()
    }

    /// Forget every in-flight render, as on a grid resync.
    pub fn reset_in_flight(&self) {
        let mut state = self.state.lock();
        state.extra.clear();
        state.being_rendered.clear();
    }

    /// Every deferred deletion, regardless of in-flight renders.
    pub fn take_all_deletions(&self) -> Vec<PathBuf> {
        self.state.lock().to_be_deleted.drain().collect()
    }

    /// Number of mapped sources.
    pub fn source_count(&self) -> usize {
        self.state.lock().by_source.len()
    }

    /// Number of distinct thumbnails in the main cache.
    pub fn thumbnail_count(&self) -> usize {
        self.state.lock().by_thumbnail.len()
    }

    /// Sources sharing `thumbnail`.
    pub fn sources_of(&self, thumbnail: &Path) -> Vec<PathBuf> {
        self.state
            .lock()
            .by_thumbnail
            .get(thumbnail)
            .map(|l| l.sources.clone())
            .unwrap_or_default()
    }

    /// Thumbnail `source` is being rendered from after leaving the main cache.
    pub fn extra(&self, source: &Path) -> Option<PathBuf> {
        self.state.lock().extra.get(source).cloned()
    }
}

/// Delete thumbnail files, logging failures.
pub fn delete_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => trace!(?path, "Deleted thumbnail"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(?path, error = %e, "Failed to delete thumbnail"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_record_and_get() {
        let cache = ThumbnailCache::new(p("/t"), 0);
        assert!(cache.record(&p("a.png"), &p("/t/1.png"), None).is_empty());
        assert_eq!(cache.get(&p("a.png")), Some(p("/t/1.png")));
        assert!(!cache.is_full());
    }

    #[test]
    fn test_bound_never_exceeded() {
        let cache = ThumbnailCache::new(p("/t"), 3);
        let mut deleted = Vec::new();
        for i in 0..10 {
            deleted.extend(cache.record(
                &p(&format!("s{}", i)),
                &p(&format!("/t/{}.png", i)),
                None,
            ));
            assert!(cache.source_count() <= 3);
        }
        assert_eq!(cache.source_count(), 3);
        // Oldest go first
        assert_eq!(&deleted[..2], &[p("/t/0.png"), p("/t/1.png")]);
        assert_eq!(deleted.len(), 7);
    }

    #[test]
    fn test_fewest_sources_evicted_first() {
        let cache = ThumbnailCache::new(p("/t"), 3);
        cache.record(&p("a"), &p("/t/shared_old.png"), None);
        // b deduplicates onto a copy of a's thumbnail: two sources share it
        let deleted = cache.record(&p("b"), &p("/t/shared.png"), Some(&p("/t/shared_old.png")));
        assert_eq!(deleted, vec![p("/t/shared_old.png")]);
        assert_eq!(cache.sources_of(&p("/t/shared.png")), vec![p("a"), p("b")]);

        cache.record(&p("c"), &p("/t/c.png"), None);
        let deleted = cache.record(&p("d"), &p("/t/d.png"), None);
        // c has one source, shared has two
        assert_eq!(deleted, vec![p("/t/c.png")]);
        assert_eq!(cache.get(&p("a")), Some(p("/t/shared.png")));
    }

    #[test]
    fn test_eviction_deferred_while_rendering() {
        let cache = ThumbnailCache::new(p("/t"), 1);
        cache.record(&p("a"), &p("/t/a.png"), None);
        assert_eq!(cache.acquire(&p("a")), Some(p("/t/a.png")));

        let deleted = cache.record(&p("b"), &p("/t/b.png"), None);
        assert!(deleted.is_empty());
        assert!(cache.get(&p("a")).is_none());
        assert_eq!(cache.extra(&p("a")), Some(p("/t/a.png")));
        assert!(cache.has_pending_deletions());
        assert!(cache.take_deletable().is_empty());

        cache.mark_rendered(&p("a"), &p("/t/a.png"));
        assert!(cache.extra(&p("a")).is_none());
        assert_eq!(cache.take_deletable(), vec![p("/t/a.png")]);
        assert!(!cache.has_pending_deletions());
    }

    #[test]
    fn test_dedup_of_in_flight_thumbnail_is_deferred() {
        let cache = ThumbnailCache::new(p("/t"), 0);
        cache.record(&p("a"), &p("/t/old.png"), None);
        cache.mark_being_rendered(&p("a"), &p("/t/old.png"));

        let deleted = cache.record(&p("b"), &p("/t/new.png"), Some(&p("/t/old.png")));
        assert!(deleted.is_empty());
        assert_eq!(cache.get(&p("a")), Some(p("/t/new.png")));
        assert_eq!(cache.extra(&p("a")), Some(p("/t/old.png")));

        cache.mark_rendered(&p("a"), &p("/t/old.png"));
        assert_eq!(cache.take_deletable(), vec![p("/t/old.png")]);
    }

    #[test]
    fn test_evicted_duplicate_falls_back_to_plain_insert() {
        let cache = ThumbnailCache::new(p("/t"), 1);
        cache.record(&p("a"), &p("/t/old.png"), None);
        let deleted = cache.record(&p("b"), &p("/t/new.png"), Some(&p("/t/old.png")));
        assert_eq!(deleted, vec![p("/t/old.png")]);
        assert_eq!(cache.sources_of(&p("/t/new.png")), vec![p("b")]);
        assert_eq!(cache.source_count(), 1);
    }

    #[test]
    fn test_re_recording_source_retires_old_thumbnail() {
        let cache = ThumbnailCache::new(p("/t"), 0);
        cache.record(&p("a"), &p("/t/1.png"), None);
        let deleted = cache.record(&p("a"), &p("/t/2.png"), None);
        assert_eq!(deleted, vec![p("/t/1.png")]);
        assert_eq!(cache.thumbnail_count(), 1);
    }

    #[test]
    fn test_reset_in_flight_allows_all_deletions() {
        let cache = ThumbnailCache::new(p("/t"), 1);
        cache.record(&p("a"), &p("/t/a.png"), None);
        cache.acquire(&p("a"));
        cache.record(&p("b"), &p("/t/b.png"), None);

        cache.reset_in_flight();
        assert!(cache.extra(&p("a")).is_none());
        assert_eq!(cache.take_all_deletions(), vec![p("/t/a.png")]);
    }

    #[test]
    fn test_delete_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.png");
        std::fs::write(&file, b"x").unwrap();
        delete_files(&[file.clone(), dir.path().join("missing.png")]);
        assert!(!file.exists());
    }
}
