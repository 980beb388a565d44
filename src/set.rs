//! Event registration table with a copy-on-dirty polling snapshot.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::events::EventMask;
use crate::socket::Socket;
use crate::sys::{PollEntry, SysHandle};

pub(crate) type FiredEvents = SmallVec<[(Arc<Socket>, EventMask); 8]>;
pub(crate) type GoneHandles = SmallVec<[SysHandle; 4]>;

/// The official registration table plus the bookkeeping for one dispatch
/// cycle.
///
/// The official entries are mutated only under the owning monitor's lock. The
/// polling snapshot lives outside the lock with the monitor thread (see
/// [`SocketSet::prepare_polling`]); the official table only flips a dirty flag
/// on mutation, so a snapshot handed to an in-flight wait call is never
/// touched concurrently.
pub(crate) struct SocketSet {
    official: Vec<PollEntry>,
    index: HashMap<SysHandle, usize>,
    dirty: bool,
    snapshot_len: usize,
    fired: FiredEvents,
    gone: GoneHandles,
}

impl SocketSet {
    pub fn new() -> SocketSet {
        SocketSet {
            official: Vec::new(),
            index: HashMap::new(),
            dirty: false,
            snapshot_len: 0,
            fired: SmallVec::new(),
            gone: SmallVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.official.len()
    }

    pub fn contains(&self, handle: SysHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn mask_of(&self, handle: SysHandle) -> Option<EventMask> {
        self.index.get(&handle).map(|&at| self.official[at].interest())
    }

    /// Removes `handle` entirely. Removing an unknown handle is a silent
    /// no-op so resets stay idempotent.
    pub fn reset(&mut self, handle: SysHandle) {
        let Some(at) = self.index.remove(&handle) else {
            return;
        };
        let mut entry = self.official.remove(at);
        entry.release();
        // O(n) over the tail; churn is rare relative to dispatch volume
        for (i, entry) in self.official.iter().enumerate().skip(at) {
            self.index.insert(entry.handle(), i);
        }
        self.dirty = true;
    }

    /// Sets (or, if absent, appends) the desired mask for `handle`. A zero
    /// mask is equivalent to [`SocketSet::reset`].
    pub fn reset_mask(&mut self, handle: SysHandle, mask: EventMask) -> io::Result<()> {
        if mask.is_empty() {
            self.reset(handle);
            return Ok(());
        }
        match self.index.get(&handle) {
            Some(&at) => {
                let entry = &mut self.official[at];
                if entry.interest() != mask {
                    entry.set_interest(mask)?;
                    self.dirty = true;
                }
            }
            None => self.append(handle, mask)?,
        }
        Ok(())
    }

    /// ORs `mask` into the desired mask, appending the handle if absent.
    /// Returns whether the set became dirty.
    pub fn add_events(&mut self, handle: SysHandle, mask: EventMask) -> io::Result<bool> {
        match self.index.get(&handle) {
            Some(&at) => {
                let entry = &mut self.official[at];
                let next = entry.interest() | mask;
                if next == entry.interest() {
                    return Ok(false);
                }
                entry.set_interest(next)?;
                self.dirty = true;
                Ok(true)
            }
            None => {
                self.append(handle, mask)?;
                Ok(true)
            }
        }
    }

    /// Clears the bits of `mask` from the desired mask; a mask that drops to
    /// zero removes the handle entirely. Returns whether the set became dirty.
    pub fn remove_events(&mut self, handle: SysHandle, mask: EventMask) -> io::Result<bool> {
        let Some(&at) = self.index.get(&handle) else {
            return Ok(false);
        };
        let current = self.official[at].interest();
        let next = current.without(mask);
        if next == current {
            return Ok(false);
        }
        if next.is_empty() {
            self.reset(handle);
        } else {
            self.official[at].set_interest(next)?;
            self.dirty = true;
        }
        Ok(true)
    }

    fn append(&mut self, handle: SysHandle, mask: EventMask) -> io::Result<()> {
        debug_assert!(!mask.is_empty());
        self.append_entry(PollEntry::new(handle, mask)?);
        Ok(())
    }

    /// Inserts a pre-built entry, used for the wakeup channel slot.
    pub fn append_entry(&mut self, entry: PollEntry) {
        assert!(
            !self.index.contains_key(&entry.handle()),
            "handle {:?} registered twice",
            entry.handle()
        );
        self.index.insert(entry.handle(), self.official.len());
        self.official.push(entry);
        self.dirty = true;
    }

    /// Refreshes the monitor thread's polling snapshot: a full copy when the
    /// official table changed since the last call, otherwise just the fired
    /// state is cleared on the existing copy. Also resets the per-cycle fired
    /// and delegate-gone buffers.
    pub fn prepare_polling(&mut self, polling: &mut Vec<PollEntry>) {
        if self.dirty {
            polling.clear();
            polling.extend_from_slice(&self.official);
            self.dirty = false;
        } else {
            for entry in polling.iter_mut() {
                entry.clear_fired();
            }
        }
        self.snapshot_len = polling.len();
        self.fired.clear();
        self.gone.clear();
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Records one fired entry for the current cycle. The buffer is bounded
    /// by the snapshot size; overflowing it means the dispatch pass is broken.
    pub fn fired_event(&mut self, socket: Arc<Socket>, mask: EventMask) {
        assert!(
            self.fired.len() < self.snapshot_len,
            "fired events exceed the polling snapshot"
        );
        self.fired.push((socket, mask));
    }

    pub fn delegate_gone(&mut self, handle: SysHandle) {
        assert!(
            self.gone.len() < self.snapshot_len,
            "delegate-gone entries exceed the polling snapshot"
        );
        self.gone.push(handle);
    }

    pub fn take_fired(&mut self) -> FiredEvents {
        std::mem::take(&mut self.fired)
    }

    pub fn take_gone(&mut self) -> GoneHandles {
        std::mem::take(&mut self.gone)
    }

    /// Drops every registration, used at monitor shutdown.
    pub fn clear(&mut self) {
        for entry in &mut self.official {
            entry.release();
        }
        self.official.clear();
        self.index.clear();
        self.fired.clear();
        self.gone.clear();
        self.dirty = true;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn masks(polling: &[PollEntry]) -> Vec<(SysHandle, EventMask)> {
        polling.iter().map(|e| (e.handle(), e.interest())).collect()
    }

    #[test]
    fn repeated_reset_with_same_mask_is_idempotent() {
        let mut set = SocketSet::new();
        set.reset_mask(5, EventMask::READABLE).unwrap();
        set.reset_mask(5, EventMask::READABLE).unwrap();

        assert_eq!(1, set.len());
        assert_eq!(Some(EventMask::READABLE), set.mask_of(5));

        // the second identical call must not re-dirty a fresh snapshot
        let mut polling = Vec::new();
        set.prepare_polling(&mut polling);
        set.reset_mask(5, EventMask::READABLE).unwrap();
        assert!(!set.is_dirty());
    }

    #[test]
    fn mask_dropping_to_zero_removes_the_handle() {
        let mut set = SocketSet::new();
        let mask = EventMask::READABLE | EventMask::WRITABLE;
        set.add_events(7, mask).unwrap();
        assert!(set.contains(7));

        set.remove_events(7, mask).unwrap();
        assert!(!set.contains(7));
        assert_eq!(0, set.len());

        let mut polling = Vec::new();
        set.prepare_polling(&mut polling);
        assert!(polling.is_empty());
    }

    #[test]
    fn reset_of_unknown_handle_is_a_no_op() {
        let mut set = SocketSet::new();
        set.reset_mask(1, EventMask::READABLE).unwrap();
        let mut polling = Vec::new();
        set.prepare_polling(&mut polling);

        set.reset(42);
        assert!(!set.is_dirty());
        assert_eq!(1, set.len());
    }

    #[test]
    fn removal_shifts_later_indices() {
        let mut set = SocketSet::new();
        set.reset_mask(10, EventMask::READABLE).unwrap();
        set.reset_mask(11, EventMask::WRITABLE).unwrap();
        set.reset_mask(12, EventMask::READABLE | EventMask::WRITABLE).unwrap();

        set.reset(11);

        assert_eq!(Some(EventMask::READABLE), set.mask_of(10));
        assert_eq!(None, set.mask_of(11));
        assert_eq!(Some(EventMask::READABLE | EventMask::WRITABLE), set.mask_of(12));

        let mut polling = Vec::new();
        set.prepare_polling(&mut polling);
        assert_eq!(
            vec![
                (10, EventMask::READABLE),
                (12, EventMask::READABLE | EventMask::WRITABLE)
            ],
            masks(&polling)
        );
    }

    #[test]
    fn snapshot_tracks_official_masks_across_interleaved_mutations() {
        let mut set = SocketSet::new();
        let mut polling = Vec::new();

        set.reset_mask(1, EventMask::READABLE).unwrap();
        set.prepare_polling(&mut polling);
        assert_eq!(vec![(1, EventMask::READABLE)], masks(&polling));

        // mutations between snapshots must not leak into the stale copy
        set.add_events(1, EventMask::WRITABLE).unwrap();
        set.reset_mask(2, EventMask::WRITABLE).unwrap();
        assert_eq!(vec![(1, EventMask::READABLE)], masks(&polling));

        set.prepare_polling(&mut polling);
        assert_eq!(
            vec![
                (1, EventMask::READABLE | EventMask::WRITABLE),
                (2, EventMask::WRITABLE)
            ],
            masks(&polling)
        );

        // a clean set leaves the snapshot untouched
        set.remove_events(2, EventMask::READABLE).unwrap();
        assert!(!set.is_dirty());
        set.prepare_polling(&mut polling);
        assert_eq!(
            vec![
                (1, EventMask::READABLE | EventMask::WRITABLE),
                (2, EventMask::WRITABLE)
            ],
            masks(&polling)
        );
    }

    #[test]
    fn clear_drops_all_registrations() {
        let mut set = SocketSet::new();
        set.reset_mask(1, EventMask::READABLE).unwrap();
        set.reset_mask(2, EventMask::WRITABLE).unwrap();

        set.clear();
        assert_eq!(0, set.len());
        assert!(!set.contains(1));

        let mut polling = Vec::new();
        set.prepare_polling(&mut polling);
        assert!(polling.is_empty());
    }
}
