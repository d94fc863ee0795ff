use std::{collections::BTreeMap, ops::{Bound, Deref, DerefMut}, sync::{Mutex, MutexGuard}};

// Map from disjoint address ranges [start, end) to values, e.g. mmapped regions or the stack trace that allocated each heap block.
// Inserting over existing ranges splits/truncates them, so the ranges never overlap.
//
// One mutex guards everything. reader() and writer() both take it exclusively and hold it until the handle is dropped;
// the only difference is that a reader handle can't mutate. Use one handle for a batch of operations (e.g. lots of
// lookups while filling an image), but don't keep it around for long: the event ingestion thread needs the same lock.
pub struct IntervalMap<V> {
    inner: Mutex<Intervals<V>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interval<V> {
    pub start: u64,
    pub end: u64,
    pub value: V,
}

impl<V> Interval<V> {
    pub fn contains(&self, addr: u64) -> bool { self.start <= addr && addr < self.end }
    pub fn len(&self) -> u64 { self.end - self.start }
}

pub struct Intervals<V> {
    // Keyed by `end`, so that the first entry with key > addr is the only candidate for containing addr.
    map: BTreeMap<u64, Interval<V>>,
}

pub struct IntervalReader<'a, V> {
    guard: MutexGuard<'a, Intervals<V>>,
}

pub struct IntervalWriter<'a, V> {
    guard: MutexGuard<'a, Intervals<V>>,
}

impl<'a, V> Deref for IntervalReader<'a, V> { type Target = Intervals<V>; fn deref(&self) -> &Intervals<V> { &self.guard } }
impl<'a, V> Deref for IntervalWriter<'a, V> { type Target = Intervals<V>; fn deref(&self) -> &Intervals<V> { &self.guard } }
impl<'a, V> DerefMut for IntervalWriter<'a, V> { fn deref_mut(&mut self) -> &mut Intervals<V> { &mut self.guard } }

impl<V> IntervalMap<V> {
    pub fn new() -> Self { Self {inner: Mutex::new(Intervals {map: BTreeMap::new()})} }

    pub fn reader(&self) -> IntervalReader<'_, V> {
        IntervalReader {guard: self.lock()}
    }

    pub fn writer(&self) -> IntervalWriter<'_, V> {
        IntervalWriter {guard: self.lock()}
    }

    fn lock(&self) -> MutexGuard<'_, Intervals<V>> {
        // A panic while holding the lock can't leave the map with overlapping intervals (splitting happens before any removal), so poisoning is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V> Intervals<V> {
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn clear(&mut self) { self.map.clear(); }

    // In order of address.
    pub fn iter(&self) -> impl Iterator<Item = &Interval<V>> + '_ { self.map.values() }

    // First interval with end > addr: either the one containing addr or the first one after it.
    fn successor(&self, addr: u64) -> Option<&Interval<V>> {
        self.map.range((Bound::Excluded(addr), Bound::Unbounded)).next().map(|(_, iv)| iv)
    }

    // Last interval with end <= addr.
    fn predecessor(&self, addr: u64) -> Option<&Interval<V>> {
        self.map.range(..=addr).next_back().map(|(_, iv)| iv)
    }

    pub fn find(&self, addr: u64) -> Option<&Interval<V>> {
        self.successor(addr).filter(|iv| iv.start <= addr)
    }

    pub fn find_after(&self, addr: u64) -> Option<&Interval<V>> {
        self.successor(addr)
    }

    // Nearest interval to addr in either direction. Distance to a containing interval is 0; on a tie the upper neighbor wins.
    pub fn find_closest(&self, addr: u64) -> Option<&Interval<V>> {
        let upper = self.successor(addr);
        if let Some(iv) = upper {
            if iv.start <= addr {
                return upper;
            }
        }
        let lower = self.predecessor(addr);
        match (lower, upper) {
            (None, u) => u,
            (l, None) => l,
            (Some(l), Some(u)) => {
                let dist_lower = addr - (l.end - 1);
                let dist_upper = u.start - addr;
                if dist_lower < dist_upper {Some(l)} else {Some(u)}
            }
        }
    }

    // Bounds of the union of all intervals, or (u64::MAX, 0) if there are none.
    pub fn total_interval(&self) -> (u64, u64) {
        match (self.map.values().next(), self.map.values().next_back()) {
            (Some(first), Some(last)) => (first.start, last.end),
            _ => (u64::MAX, 0),
        }
    }
}

impl<V: Clone> Intervals<V> {
    pub fn insert(&mut self, start: u64, end: u64, value: V) {
        debug_assert!(start < end, "empty interval [{:x}, {:x})", start, end);
        if start >= end {
            return;
        }
        self.erase(start, end);
        self.map.insert(end, Interval {start, end, value});
    }

    pub fn erase(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        if start >= end {
            return;
        }
        for key in self.isolate(start, end) {
            self.map.remove(&key);
        }
    }

    // Calls f for each interval (split at start and end if needed) inside [start, end).
    pub fn apply<F: FnMut(&mut Interval<V>)>(&mut self, start: u64, end: u64, mut f: F) {
        if start >= end {
            return;
        }
        for key in self.isolate(start, end) {
            let iv = self.map.get_mut(&key).unwrap();
            f(iv);
            debug_assert!(iv.start >= start && iv.end == key, "apply() callback must not change interval bounds");
        }
    }

    // Splits intervals that cross `start` or `end`, so that every interval overlapping [start, end) lies entirely inside it.
    // Returns keys of those intervals, in order.
    fn isolate(&mut self, start: u64, end: u64) -> Vec<u64> {
        let keys: Vec<u64> = self.map.range((Bound::Excluded(start), Bound::Unbounded)).take_while(|(_, iv)| iv.start < end).map(|(k, _)| *k).collect();
        let mut res = Vec::with_capacity(keys.len());
        for key in keys {
            let iv = self.map.get_mut(&key).unwrap();
            if iv.start < start {
                // Left remainder [iv.start, start) keeps the value.
                let left = Interval {start: iv.start, end: start, value: iv.value.clone()};
                iv.start = start;
                self.map.insert(start, left);
            }
            let iv = self.map.get_mut(&key).unwrap();
            if key > end {
                // Right remainder stays under the old key; the part inside moves to key `end`.
                let inside = Interval {start: iv.start, end, value: iv.value.clone()};
                iv.start = end;
                self.map.insert(end, inside);
                res.push(end);
            } else {
                res.push(key);
            }
        }
        res
    }
}
