//! Reference strength management
//!
//! Weak, soft and phantom references are explicit registrations held
//! outside the heap. Their referents are not traced; once strong
//! reachability is known the collector asks this manager what to do with
//! each one, in this order:
//!
//! 1. **Soft**: retained (and traced) unless memory pressure is signalled,
//!    in which case an unreached referent is cleared and the handle enqueued.
//! 2. **Weak**: an unreached referent is cleared and the handle enqueued.
//! 3. **Phantom**: an unreached referent is kept alive and the handle
//!    enqueued. The referent stays alive until the handle is cleared; the
//!    next cycle after that reclaims it.
//!
//! Strong registrations behave as global roots.
//!
//! Queues are pull-based. A queue created with [`QueuePolicy::DropOldest`]
//! is lossy: once full, every new notification discards the oldest one.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::error::{GcError, GcResult};
use crate::object::Address;

/// Strength of a registered reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Keeps the referent alive, acts as a root
    Strong,
    /// Cleared as soon as the referent is otherwise unreachable
    Weak,
    /// Cleared only under memory pressure
    Soft,
    /// Never exposes the referent; notifies before reclamation
    Phantom,
}

/// Handle to a registered reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefHandle(u32);

/// Handle to a notification queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u32);

impl QueueId {
    /// The unbounded queue every heap starts with
    pub const DEFAULT: QueueId = QueueId(0);
}

/// Backpressure policy of a notification queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Grow without limit
    #[default]
    Unbounded,
    /// Keep at most this many notifications, discarding the oldest (lossy)
    DropOldest(usize),
}

/// Lifecycle of a reference record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// Referent set, not yet processed
    Active,
    /// Notification posted. Weak and soft referents are already null;
    /// phantom referents stay alive until [`ReferenceManager::clear`].
    Enqueued,
    /// Explicitly cleared by the owner
    Cleared,
}

/// A notification delivered through a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Reference that was processed
    pub handle: RefHandle,
    /// Its kind
    pub kind: ReferenceKind,
}

#[derive(Debug)]
struct ReferenceRecord {
    kind: ReferenceKind,
    referent: Address,
    queue: QueueId,
    state: RefState,
}

#[derive(Debug, Default)]
struct ReferenceQueue {
    policy: QueuePolicy,
    pending: VecDeque<Notification>,
    dropped: u64,
}

impl ReferenceQueue {
    fn push(&mut self, notification: Notification) {
        self.pending.push_back(notification);
        if let QueuePolicy::DropOldest(capacity) = self.policy {
            while self.pending.len() > capacity {
                self.pending.pop_front();
                self.dropped += 1;
            }
        }
    }
}

/// Reachability as seen by the collector running the current cycle
pub(crate) trait Reachability {
    /// Whether this collection decides the fate of `addr`
    fn in_scope(&self, addr: Address) -> bool;

    /// Whether `addr` has been reached so far
    fn is_reached(&self, addr: Address) -> bool;

    /// Make `addr` and everything it reaches survive this cycle
    fn retain(&mut self, addr: Address) -> GcResult<()>;
}

/// What a cycle decided, applied once relocation is certain to proceed
#[derive(Debug, Default)]
pub(crate) struct ReferenceDecisions {
    cleared: Vec<RefHandle>,
    phantoms: Vec<RefHandle>,
}

impl ReferenceDecisions {
    /// Number of references cleared or enqueued
    pub(crate) fn len(&self) -> usize {
        self.cleared.len() + self.phantoms.len()
    }
}

/// Registry of weak, soft, phantom and strong references
#[derive(Debug)]
pub struct ReferenceManager {
    records: FxHashMap<RefHandle, ReferenceRecord>,
    queues: Vec<ReferenceQueue>,
    next_handle: u32,
    memory_pressure: bool,
}

impl ReferenceManager {
    /// Create a manager with the default unbounded queue
    pub fn new() -> Self {
        Self {
            records: FxHashMap::default(),
            queues: vec![ReferenceQueue::default()],
            next_handle: 0,
            memory_pressure: false,
        }
    }

    /// Create a notification queue
    pub fn create_queue(&mut self, policy: QueuePolicy) -> QueueId {
        let id = QueueId(self.queues.len() as u32);
        self.queues.push(ReferenceQueue {
            policy,
            ..ReferenceQueue::default()
        });
        id
    }

    /// Register a reference. The caller has checked that `referent` is an object.
    pub fn register(
        &mut self,
        kind: ReferenceKind,
        referent: Address,
        queue: Option<QueueId>,
    ) -> GcResult<RefHandle> {
        if referent.is_null() {
            return Err(GcError::NullReferent);
        }
        let queue = queue.unwrap_or(QueueId::DEFAULT);
        self.queue(queue)?;

        let handle = RefHandle(self.next_handle);
        self.next_handle += 1;
        self.records.insert(
            handle,
            ReferenceRecord {
                kind,
                referent,
                queue,
                state: RefState::Active,
            },
        );
        Ok(handle)
    }

    fn record(&self, handle: RefHandle) -> GcResult<&ReferenceRecord> {
        self.records.get(&handle).ok_or(GcError::UnknownHandle(handle))
    }

    fn queue(&self, queue: QueueId) -> GcResult<&ReferenceQueue> {
        self.queues
            .get(queue.0 as usize)
            .ok_or(GcError::UnknownQueue(queue))
    }

    /// Current referent. Always `None` for phantom references.
    pub fn get(&self, handle: RefHandle) -> GcResult<Option<Address>> {
        let record = self.record(handle)?;
        if record.kind == ReferenceKind::Phantom || record.referent.is_null() {
            return Ok(None);
        }
        Ok(Some(record.referent))
    }

    /// Kind of a reference
    pub fn kind(&self, handle: RefHandle) -> GcResult<ReferenceKind> {
        Ok(self.record(handle)?.kind)
    }

    /// Lifecycle state of a reference
    pub fn state(&self, handle: RefHandle) -> GcResult<RefState> {
        Ok(self.record(handle)?.state)
    }

    /// Whether a notification was posted for this reference
    pub fn is_enqueued(&self, handle: RefHandle) -> GcResult<bool> {
        Ok(self.record(handle)?.state == RefState::Enqueued)
    }

    /// Clear a reference. A pending phantom referent becomes reclaimable.
    pub fn clear(&mut self, handle: RefHandle) -> GcResult<()> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or(GcError::UnknownHandle(handle))?;
        record.referent = Address::NULL;
        record.state = RefState::Cleared;
        Ok(())
    }

    /// Drop a registration entirely
    pub fn unregister(&mut self, handle: RefHandle) -> GcResult<()> {
        self.records
            .remove(&handle)
            .map(|_| ())
            .ok_or(GcError::UnknownHandle(handle))
    }

    /// Take the oldest notification from a queue
    pub fn poll(&mut self, queue: QueueId) -> GcResult<Option<Notification>> {
        let queue = self
            .queues
            .get_mut(queue.0 as usize)
            .ok_or(GcError::UnknownQueue(queue))?;
        Ok(queue.pending.pop_front())
    }

    /// Notifications waiting in a queue
    pub fn pending(&self, queue: QueueId) -> GcResult<usize> {
        Ok(self.queue(queue)?.pending.len())
    }

    /// Notifications a lossy queue has discarded
    pub fn dropped(&self, queue: QueueId) -> GcResult<u64> {
        Ok(self.queue(queue)?.dropped)
    }

    /// Number of registered references
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no reference is registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether soft references are cleared by the next cycle
    pub fn memory_pressure(&self) -> bool {
        self.memory_pressure
    }

    /// Signal or withdraw memory pressure
    pub fn set_memory_pressure(&mut self, pressure: bool) {
        self.memory_pressure = pressure;
    }

    /// Whether any soft reference still has a referent that pressure could clear
    pub(crate) fn has_active_soft(&self) -> bool {
        self.records.values().any(|r| {
            r.kind == ReferenceKind::Soft && r.state == RefState::Active && !r.referent.is_null()
        })
    }

    fn sorted_handles(&self) -> Vec<RefHandle> {
        let mut handles: Vec<RefHandle> = self.records.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Referents of strong registrations
    pub(crate) fn strong_referents(&self) -> Vec<Address> {
        self.records
            .values()
            .filter(|r| r.kind == ReferenceKind::Strong && !r.referent.is_null())
            .map(|r| r.referent)
            .collect()
    }

    /// Every non-null referent with its handle
    pub(crate) fn referents(&self) -> impl Iterator<Item = (RefHandle, Address)> + '_ {
        self.records
            .iter()
            .filter(|(_, r)| !r.referent.is_null())
            .map(|(&h, r)| (h, r.referent))
    }

    /// Decide the fate of every in-scope referent, tracing retained ones.
    ///
    /// Nothing is modified here; an error from `retain` leaves the
    /// manager untouched.
    pub(crate) fn plan(
        &self,
        reach: &mut dyn Reachability,
        pressure: bool,
    ) -> GcResult<ReferenceDecisions> {
        let handles = self.sorted_handles();
        let mut decisions = ReferenceDecisions::default();

        let candidates = |kind: ReferenceKind| -> Vec<RefHandle> {
            handles
                .iter()
                .copied()
                .filter(|h| {
                    let record = &self.records[h];
                    record.kind == kind && !record.referent.is_null()
                })
                .collect()
        };

        // Soft before weak: a retained soft referent keeps weak ones set
        for handle in candidates(ReferenceKind::Soft) {
            let record = &self.records[&handle];
            if record.state != RefState::Active
                || !reach.in_scope(record.referent)
                || reach.is_reached(record.referent)
            {
                continue;
            }
            if pressure {
                decisions.cleared.push(handle);
            } else {
                reach.retain(record.referent)?;
            }
        }

        for handle in candidates(ReferenceKind::Weak) {
            let record = &self.records[&handle];
            if record.state == RefState::Active
                && reach.in_scope(record.referent)
                && !reach.is_reached(record.referent)
            {
                decisions.cleared.push(handle);
            }
        }

        for handle in candidates(ReferenceKind::Phantom) {
            let record = &self.records[&handle];
            if !reach.in_scope(record.referent) {
                continue;
            }
            match record.state {
                RefState::Active if !reach.is_reached(record.referent) => {
                    decisions.phantoms.push(handle);
                    reach.retain(record.referent)?;
                }
                RefState::Enqueued => reach.retain(record.referent)?,
                _ => {}
            }
        }

        Ok(decisions)
    }

    /// Clear and enqueue what [`plan`](Self::plan) decided
    pub(crate) fn apply(&mut self, decisions: ReferenceDecisions) {
        for handle in decisions.cleared {
            if let Some(record) = self.records.get_mut(&handle) {
                record.referent = Address::NULL;
                record.state = RefState::Enqueued;
                let notification = Notification {
                    handle,
                    kind: record.kind,
                };
                self.queues[record.queue.0 as usize].push(notification);
            }
        }
        for handle in decisions.phantoms {
            if let Some(record) = self.records.get_mut(&handle) {
                record.state = RefState::Enqueued;
                let notification = Notification {
                    handle,
                    kind: record.kind,
                };
                self.queues[record.queue.0 as usize].push(notification);
            }
        }
    }

    /// Rewrite every non-null referent through `relocate`
    pub(crate) fn rewrite_referents(&mut self, mut relocate: impl FnMut(Address) -> Address) {
        for record in self.records.values_mut() {
            if !record.referent.is_null() {
                record.referent = relocate(record.referent);
            }
        }
    }
}

impl Default for ReferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    /// Reachability over a fixed set, where retaining just adds the address
    #[derive(Default)]
    struct FakeReach {
        reached: FxHashSet<Address>,
        retained: Vec<Address>,
    }

    impl Reachability for FakeReach {
        fn in_scope(&self, addr: Address) -> bool {
            addr.as_u64() < 0x1000
        }

        fn is_reached(&self, addr: Address) -> bool {
            self.reached.contains(&addr)
        }

        fn retain(&mut self, addr: Address) -> GcResult<()> {
            self.reached.insert(addr);
            self.retained.push(addr);
            Ok(())
        }
    }

    const OBJ: Address = Address::new(0x100);

    #[test]
    fn test_weak_cleared_when_unreached() {
        let mut refs = ReferenceManager::new();
        let weak = refs.register(ReferenceKind::Weak, OBJ, None).unwrap();

        let decisions = refs.plan(&mut FakeReach::default(), false).unwrap();
        assert_eq!(decisions.len(), 1);
        refs.apply(decisions);

        assert_eq!(refs.get(weak).unwrap(), None);
        assert!(refs.is_enqueued(weak).unwrap());
        assert_eq!(
            refs.poll(QueueId::DEFAULT).unwrap(),
            Some(Notification {
                handle: weak,
                kind: ReferenceKind::Weak
            })
        );
        assert_eq!(refs.poll(QueueId::DEFAULT).unwrap(), None);
    }

    #[test]
    fn test_out_of_scope_referents_untouched() {
        let mut refs = ReferenceManager::new();
        let weak = refs
            .register(ReferenceKind::Weak, Address::new(0x5000), None)
            .unwrap();
        let decisions = refs.plan(&mut FakeReach::default(), false).unwrap();
        assert_eq!(decisions.len(), 0);
        refs.apply(decisions);
        assert_eq!(refs.get(weak).unwrap(), Some(Address::new(0x5000)));
    }

    #[test]
    fn test_soft_retention_keeps_weak_set() {
        let mut refs = ReferenceManager::new();
        let soft = refs.register(ReferenceKind::Soft, OBJ, None).unwrap();
        let weak = refs.register(ReferenceKind::Weak, OBJ, None).unwrap();

        let mut reach = FakeReach::default();
        let decisions = refs.plan(&mut reach, false).unwrap();
        assert_eq!(reach.retained, vec![OBJ]);
        refs.apply(decisions);

        assert_eq!(refs.get(soft).unwrap(), Some(OBJ));
        assert_eq!(refs.get(weak).unwrap(), Some(OBJ));
        assert_eq!(refs.pending(QueueId::DEFAULT).unwrap(), 0);
    }

    #[test]
    fn test_pressure_clears_soft_and_weak() {
        let mut refs = ReferenceManager::new();
        let soft = refs.register(ReferenceKind::Soft, OBJ, None).unwrap();
        let weak = refs.register(ReferenceKind::Weak, OBJ, None).unwrap();

        let decisions = refs.plan(&mut FakeReach::default(), true).unwrap();
        refs.apply(decisions);

        assert_eq!(refs.get(soft).unwrap(), None);
        assert_eq!(refs.get(weak).unwrap(), None);
        assert_eq!(refs.pending(QueueId::DEFAULT).unwrap(), 2);
    }

    #[test]
    fn test_phantom_lifecycle() {
        let mut refs = ReferenceManager::new();
        let queue = refs.create_queue(QueuePolicy::Unbounded);
        let phantom = refs
            .register(ReferenceKind::Phantom, OBJ, Some(queue))
            .unwrap();
        assert_eq!(refs.get(phantom).unwrap(), None);

        // First cycle: enqueued and kept alive
        let mut reach = FakeReach::default();
        let decisions = refs.plan(&mut reach, false).unwrap();
        refs.apply(decisions);
        assert_eq!(reach.retained, vec![OBJ]);
        assert_eq!(refs.state(phantom).unwrap(), RefState::Enqueued);
        assert_eq!(refs.poll(queue).unwrap().map(|n| n.handle), Some(phantom));

        // Still pending: kept alive again, not enqueued twice
        let mut reach = FakeReach::default();
        let decisions = refs.plan(&mut reach, false).unwrap();
        assert_eq!(decisions.len(), 0);
        assert_eq!(reach.retained, vec![OBJ]);

        // Cleared: nothing retains it anymore
        refs.clear(phantom).unwrap();
        let mut reach = FakeReach::default();
        refs.plan(&mut reach, false).unwrap();
        assert!(reach.retained.is_empty());
    }

    #[test]
    fn test_drop_oldest_queue_is_lossy() {
        let mut refs = ReferenceManager::new();
        let queue = refs.create_queue(QueuePolicy::DropOldest(2));
        let handles: Vec<RefHandle> = (0..3)
            .map(|i| {
                refs.register(ReferenceKind::Weak, Address::new(0x100 + i * 0x20), Some(queue))
                    .unwrap()
            })
            .collect();

        let decisions = refs.plan(&mut FakeReach::default(), false).unwrap();
        refs.apply(decisions);

        assert_eq!(refs.pending(queue).unwrap(), 2);
        assert_eq!(refs.dropped(queue).unwrap(), 1);
        assert_eq!(refs.poll(queue).unwrap().map(|n| n.handle), Some(handles[1]));
        assert_eq!(refs.poll(queue).unwrap().map(|n| n.handle), Some(handles[2]));
    }

    #[test]
    fn test_registration_errors() {
        let mut refs = ReferenceManager::new();
        assert_eq!(
            refs.register(ReferenceKind::Weak, Address::NULL, None),
            Err(GcError::NullReferent)
        );
        let bogus = QueueId(9);
        assert_eq!(
            refs.register(ReferenceKind::Weak, OBJ, Some(bogus)),
            Err(GcError::UnknownQueue(bogus))
        );

        let strong = refs.register(ReferenceKind::Strong, OBJ, None).unwrap();
        assert_eq!(refs.strong_referents(), vec![OBJ]);
        refs.unregister(strong).unwrap();
        assert_eq!(refs.get(strong), Err(GcError::UnknownHandle(strong)));
        assert!(refs.is_empty());
    }

    #[test]
    fn test_rewrite_referents() {
        let mut refs = ReferenceManager::new();
        let weak = refs.register(ReferenceKind::Weak, OBJ, None).unwrap();
        refs.rewrite_referents(|addr| addr.offset(0x40));
        assert_eq!(refs.get(weak).unwrap(), Some(Address::new(0x140)));
    }
}
