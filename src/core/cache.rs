//! Per-node adaptive frame cache: LRU list with a bounded ghost region.
//!
//! Structure: one doubly linked list ordered MRU → LRU, stored in a slab of slots addressed
//! by index, plus `HashMap<frame index, slot>`.
//!
//! ```text
//!  first (MRU)                      boundary                 last (LRU)
//!    [live] <-> [live] <-> [live] <-> [ghost] <-> [ghost] <-> [ghost]
//! ```
//!
//! - Entries before `boundary` hold a frame ("live"), entries from `boundary` on only
//!   remember the key ("ghost").
//! - Evicting a live entry just moves the boundary one step towards the head and drops the
//!   payload; ghosts past `max_ghost` are unlinked from the tail and forgotten.
//! - A lookup that lands on a ghost is a *near miss* (the entry was evicted too early), one
//!   that finds nothing is a *far miss*. Their ratio drives [`FrameCache::recommend_resize`].
//!
//! Benefits:
//! - O(1) insert, lookup, eviction and MRU promotion
//! - no payload held for ghosts, so sizing evidence is cheap

use std::collections::HashMap;

use log::{debug, trace};
use serde::Serialize;

use crate::config::CachePolicy;
use crate::entities::Frame;

/// Outcome of [`FrameCache::recommend_resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheAction {
    Grow,
    NoChange,
    Shrink,
    /// No accesses at all since the last decision
    Clear,
}

/// Counters snapshot for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub near_misses: u64,
    pub far_misses: u64,
    pub live: usize,
    pub ghosts: usize,
    pub max_live: usize,
    pub max_ghost: usize,
}

#[derive(Debug)]
struct Slot {
    key: i32,
    frame: Option<Frame>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Adaptive LRU cache of frames keyed by frame index.
#[derive(Debug)]
pub struct FrameCache {
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<i32, usize>,

    first: Option<usize>,
    /// First ghost entry; everything from here to `last` has no payload
    boundary: Option<usize>,
    last: Option<usize>,

    live: usize,
    ghosts: usize,
    max_live: usize,
    max_ghost: usize,
    fixed_size: bool,

    hits: u64,
    near_misses: u64,
    far_misses: u64,

    policy: CachePolicy,
}

impl FrameCache {
    /// Create an empty cache with explicit bounds.
    pub fn new(max_live: usize, max_ghost: usize, fixed_size: bool) -> Self {
        Self::with_policy(max_live, max_ghost, fixed_size, CachePolicy::default())
    }

    /// Create an empty cache sized from `policy`.
    pub fn from_policy(policy: CachePolicy) -> Self {
        Self::with_policy(
            policy.initial_max_live,
            policy.initial_max_ghost,
            false,
            policy,
        )
    }

    pub fn with_policy(
        max_live: usize,
        max_ghost: usize,
        fixed_size: bool,
        policy: CachePolicy,
    ) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            first: None,
            boundary: None,
            last: None,
            live: 0,
            ghosts: 0,
            max_live: max_live.max(policy.min_live),
            max_ghost,
            fixed_size,
            hits: 0,
            near_misses: 0,
            far_misses: 0,
            policy,
        }
    }

    // ========== Queries ==========

    pub fn max_live(&self) -> usize {
        self.max_live
    }

    pub fn max_ghost(&self) -> usize {
        self.max_ghost
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn ghost_count(&self) -> usize {
        self.ghosts
    }

    /// Live + ghost entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn near_misses(&self) -> u64 {
        self.near_misses
    }

    pub fn far_misses(&self) -> u64 {
        self.far_misses
    }

    /// Key is present with a payload.
    pub fn contains(&self, key: i32) -> bool {
        self.index
            .get(&key)
            .is_some_and(|&i| self.slots[i].frame.is_some())
    }

    /// Key is remembered without payload.
    pub fn is_ghost(&self, key: i32) -> bool {
        self.index
            .get(&key)
            .is_some_and(|&i| self.slots[i].frame.is_none())
    }

    /// Live keys from MRU to LRU.
    pub fn live_keys(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.live);
        let mut cur = self.first;
        while let Some(i) = cur {
            if Some(i) == self.boundary {
                break;
            }
            out.push(self.slots[i].key);
            cur = self.slots[i].next;
        }
        out
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            near_misses: self.near_misses,
            far_misses: self.far_misses,
            live: self.live,
            ghosts: self.ghosts,
            max_live: self.max_live,
            max_ghost: self.max_ghost,
        }
    }

    // ========== Mutation ==========

    /// Insert `frame` at MRU, replacing any previous entry for `key`.
    ///
    /// LRU live entries are demoted to ghosts to make room; ghosts beyond `max_ghost` are
    /// forgotten.
    pub fn insert(&mut self, key: i32, frame: Frame) {
        self.remove(key);
        self.trim(self.max_live.saturating_sub(1), self.max_ghost);

        let slot = Slot {
            key,
            frame: Some(frame),
            prev: None,
            next: self.first,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };

        if let Some(f) = self.first {
            self.slots[f].prev = Some(i);
        }
        self.first = Some(i);
        if self.last.is_none() {
            self.last = Some(i);
        }
        self.index.insert(key, i);
        self.live += 1;

        self.trim(self.max_live, self.max_ghost);
        trace!("cache insert {} (live {}, ghost {})", key, self.live, self.ghosts);
    }

    /// Look up `key`. A live hit is promoted to MRU.
    pub fn lookup(&mut self, key: i32) -> Option<Frame> {
        let Some(&i) = self.index.get(&key) else {
            self.far_misses += 1;
            return None;
        };

        if self.slots[i].frame.is_none() {
            self.near_misses += 1;
            return None;
        }

        self.hits += 1;
        self.move_to_front(i);
        self.slots[i].frame.clone()
    }

    /// Forget `key` entirely. Returns true if it was present (live or ghost).
    pub fn remove(&mut self, key: i32) -> bool {
        match self.index.get(&key) {
            Some(&i) => {
                self.unlink(i);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and reset counters.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.first = None;
        self.boundary = None;
        self.last = None;
        self.live = 0;
        self.ghosts = 0;
        self.clear_stats();
    }

    pub fn clear_stats(&mut self) {
        self.hits = 0;
        self.near_misses = 0;
        self.far_misses = 0;
    }

    pub fn set_max_live(&mut self, max_live: usize) {
        self.max_live = max_live.max(self.policy.min_live);
        self.trim(self.max_live, self.max_ghost);
    }

    pub fn set_max_ghost(&mut self, max_ghost: usize) {
        self.max_ghost = max_ghost;
        self.trim(self.max_live, self.max_ghost);
    }

    pub fn set_fixed_size(&mut self, fixed: bool) {
        self.fixed_size = fixed;
    }

    // ========== Sizing ==========

    /// Decide whether this cache should change size based on the accesses seen since the
    /// last decision.
    ///
    /// Below `min_accesses` the counters keep accumulating; any other decision resets
    /// them.
    pub fn recommend_resize(&mut self) -> CacheAction {
        let total = self.hits + self.near_misses + self.far_misses;

        if total == 0 {
            return CacheAction::Clear;
        }
        if total < self.policy.min_accesses {
            return CacheAction::NoChange;
        }

        let near = self.near_misses as f64 / total as f64;
        let far = self.far_misses as f64 / total as f64;
        self.clear_stats();

        if near > self.policy.grow_near_miss {
            CacheAction::Grow
        } else if far > self.policy.shrink_far_miss {
            CacheAction::Shrink
        } else {
            CacheAction::NoChange
        }
    }

    /// Apply [`recommend_resize`](Self::recommend_resize). Fixed-size caches are left alone.
    ///
    /// Under memory pressure a cache never grows: Shrink takes the bigger pressure step and
    /// NoChange still gives up one slot.
    pub fn adjust(&mut self, need_memory: bool) -> CacheAction {
        if self.fixed_size {
            return CacheAction::NoChange;
        }

        let action = self.recommend_resize();
        let before = self.max_live;

        match (need_memory, action) {
            (_, CacheAction::Clear) => self.clear(),
            (false, CacheAction::Grow) => self.set_max_live(self.max_live + self.policy.grow_step),
            (false, CacheAction::Shrink) => {
                self.set_max_live(self.max_live.saturating_sub(self.policy.shrink_step))
            }
            (false, CacheAction::NoChange) => {}
            (true, CacheAction::Shrink) => {
                if self.max_live <= 2 {
                    self.clear();
                }
                self.set_max_live(self.max_live.saturating_sub(self.policy.pressure_shrink_step));
            }
            (true, CacheAction::NoChange) | (true, CacheAction::Grow) => {
                if self.max_live <= 1 {
                    self.clear();
                }
                self.set_max_live(self.max_live.saturating_sub(1));
            }
        }

        if before != self.max_live {
            debug!(
                "cache resize {:?}{}: {} -> {}",
                action,
                if need_memory { " (memory pressure)" } else { "" },
                before,
                self.max_live
            );
        }
        action
    }

    // ========== List plumbing ==========

    /// Demote live entries until `live <= max`, then forget ghosts until
    /// `ghosts <= max_ghost`.
    fn trim(&mut self, max: usize, max_ghost: usize) {
        while self.live > max {
            let victim = match self.boundary {
                None => self.last,
                Some(b) => self.slots[b].prev,
            };
            let Some(v) = victim else { break };
            self.slots[v].frame = None;
            self.boundary = Some(v);
            self.live -= 1;
            self.ghosts += 1;
        }

        while self.ghosts > max_ghost {
            let Some(l) = self.last else { break };
            self.unlink(l);
        }
    }

    fn move_to_front(&mut self, i: usize) {
        if self.first == Some(i) {
            return;
        }
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        if let Some(p) = prev {
            self.slots[p].next = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        if self.last == Some(i) {
            self.last = prev;
        }

        self.slots[i].prev = None;
        self.slots[i].next = self.first;
        if let Some(f) = self.first {
            self.slots[f].prev = Some(i);
        }
        self.first = Some(i);
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);

        if self.boundary == Some(i) {
            self.boundary = next;
        }
        if let Some(p) = prev {
            self.slots[p].next = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        if self.first == Some(i) {
            self.first = next;
        }
        if self.last == Some(i) {
            self.last = prev;
        }

        if self.slots[i].frame.take().is_some() {
            self.live -= 1;
        } else {
            self.ghosts -= 1;
        }
        self.slots[i].prev = None;
        self.slots[i].next = None;
        self.index.remove(&self.slots[i].key);
        self.free.push(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::entities::VideoFormat;
    use std::sync::Arc;

    fn frame(mem: &Arc<CacheManager>) -> Frame {
        Frame::new_video(VideoFormat::GRAY8, 4, 4, None, mem)
    }

    fn mem() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(usize::MAX))
    }

    #[test]
    fn insert_then_lookup_is_a_hit() {
        let mem = mem();
        let mut cache = FrameCache::new(4, 4, false);
        let f = frame(&mem);
        cache.insert(7, f.clone());

        let got = cache.lookup(7).expect("cached");
        assert!(Frame::ptr_eq(&got, &f));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.near_misses(), 0);
        assert_eq!(cache.far_misses(), 0);
    }

    #[test]
    fn double_insert_keeps_one_live_entry_at_mru() {
        let mem = mem();
        let mut cache = FrameCache::new(4, 4, false);
        cache.insert(1, frame(&mem));
        cache.insert(2, frame(&mem));
        cache.insert(1, frame(&mem));

        assert_eq!(cache.live_count(), 2);
        assert_eq!(cache.ghost_count(), 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.live_keys(), vec![1, 2]);
    }

    #[test]
    fn eviction_demotes_to_ghost_then_forgets() {
        let mem = mem();
        let mut cache = FrameCache::new(2, 2, false);
        for k in 0..3 {
            cache.insert(k, frame(&mem));
        }
        // 0 evicted into the ghost region
        assert!(cache.is_ghost(0));
        assert_eq!(cache.live_count(), 2);
        assert!(cache.lookup(0).is_none());
        assert_eq!(cache.near_misses(), 1);

        // push two more ghosts in; 0 falls off the ghost tail
        cache.insert(3, frame(&mem));
        cache.insert(4, frame(&mem));
        assert_eq!(cache.ghost_count(), 2);
        assert!(!cache.is_ghost(0));
        assert!(cache.lookup(0).is_none());
        assert_eq!(cache.far_misses(), 1);
        assert_eq!(cache.near_misses(), 1);
    }

    #[test]
    fn eviction_releases_frame_memory() {
        let mem = mem();
        let mut cache = FrameCache::new(1, 8, false);
        cache.insert(0, frame(&mem));
        let one = mem.used();
        cache.insert(1, frame(&mem));
        assert_eq!(mem.used(), one);
        assert!(cache.is_ghost(0));
    }

    #[test]
    fn hit_promotes_to_mru() {
        let mem = mem();
        let mut cache = FrameCache::new(3, 3, false);
        for k in 0..3 {
            cache.insert(k, frame(&mem));
        }
        assert_eq!(cache.live_keys(), vec![2, 1, 0]);
        cache.lookup(0);
        assert_eq!(cache.live_keys(), vec![0, 2, 1]);
        cache.insert(3, frame(&mem));
        // 1 was LRU
        assert!(cache.is_ghost(1));
        assert!(cache.contains(0));
    }

    #[test]
    fn reinserting_a_ghost_makes_it_live() {
        let mem = mem();
        let mut cache = FrameCache::new(1, 4, false);
        cache.insert(0, frame(&mem));
        cache.insert(1, frame(&mem));
        assert!(cache.is_ghost(0));
        cache.insert(0, frame(&mem));
        assert!(cache.contains(0));
        assert!(cache.is_ghost(1));
        assert_eq!(cache.live_count(), 1);
        assert_eq!(cache.ghost_count(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn shrinking_bounds_trims() {
        let mem = mem();
        let mut cache = FrameCache::new(4, 4, false);
        for k in 0..4 {
            cache.insert(k, frame(&mem));
        }
        cache.set_max_live(2);
        assert_eq!(cache.live_count(), 2);
        assert_eq!(cache.ghost_count(), 2);
        cache.set_max_ghost(0);
        assert_eq!(cache.ghost_count(), 0);
        assert_eq!(cache.len(), 2);
        cache.set_max_live(0);
        assert_eq!(cache.max_live(), 1);
        assert_eq!(cache.live_count(), 1);
    }

    fn with_counts(hits: u64, near: u64, far: u64) -> FrameCache {
        let mut cache = FrameCache::new(10, 10, false);
        cache.hits = hits;
        cache.near_misses = near;
        cache.far_misses = far;
        cache
    }

    #[test]
    fn recommend_below_threshold_is_no_change() {
        let mut cache = with_counts(0, 20, 9);
        assert_eq!(cache.recommend_resize(), CacheAction::NoChange);
        // counters keep accumulating
        assert_eq!(cache.near_misses(), 20);
    }

    #[test]
    fn recommend_grow_on_near_misses() {
        let mut cache = with_counts(25, 10, 5);
        assert_eq!(cache.recommend_resize(), CacheAction::Grow);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn recommend_shrink_on_far_misses() {
        let mut cache = with_counts(1, 1, 38);
        assert_eq!(cache.recommend_resize(), CacheAction::Shrink);
    }

    #[test]
    fn recommend_clear_without_accesses() {
        let mut cache = with_counts(0, 0, 0);
        assert_eq!(cache.recommend_resize(), CacheAction::Clear);
    }

    #[test]
    fn recommend_steady_state_is_no_change() {
        let mut cache = with_counts(30, 2, 8);
        assert_eq!(cache.recommend_resize(), CacheAction::NoChange);
    }

    #[test]
    fn adjust_applies_policy_steps() {
        let mut cache = with_counts(25, 10, 5);
        assert_eq!(cache.adjust(false), CacheAction::Grow);
        assert_eq!(cache.max_live(), 12);

        cache.far_misses = 40;
        assert_eq!(cache.adjust(false), CacheAction::Shrink);
        assert_eq!(cache.max_live(), 11);

        cache.hits = 40;
        assert_eq!(cache.adjust(true), CacheAction::NoChange);
        assert_eq!(cache.max_live(), 10);

        cache.far_misses = 40;
        assert_eq!(cache.adjust(true), CacheAction::Shrink);
        assert_eq!(cache.max_live(), 8);
    }

    #[test]
    fn adjust_never_below_floor() {
        let mut cache = FrameCache::new(1, 1, false);
        cache.far_misses = 50;
        cache.adjust(false);
        assert_eq!(cache.max_live(), 1);
        cache.hits = 40;
        cache.adjust(true);
        assert_eq!(cache.max_live(), 1);
    }

    #[test]
    fn fixed_size_ignores_adjust() {
        let mut cache = FrameCache::new(5, 5, true);
        cache.near_misses = 40;
        assert_eq!(cache.adjust(false), CacheAction::NoChange);
        assert_eq!(cache.max_live(), 5);
        assert_eq!(cache.near_misses(), 40);
    }

    #[test]
    fn clear_on_idle_window() {
        let mem = mem();
        let mut cache = FrameCache::new(4, 4, false);
        cache.insert(0, frame(&mem));
        assert_eq!(cache.adjust(false), CacheAction::Clear);
        assert!(cache.is_empty());
        assert_eq!(mem.used(), 0);
    }
}
