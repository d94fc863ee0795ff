use crate::{*, error::*, os::*, state::*, executor::*, interval_map::*, tracker::StackTraceEntry, util::*, log::*};
use std::{fmt, sync::{Arc, atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering}}};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub address_bits: u32,
    pub ignore_bits: u32,
    pub page_bits: u32,
    pub top_bits: u32,
}

pub const MAX_ADDRESS_BITS: u32 = 40;
pub const MIN_ADDRESS_BITS: u32 = 16;

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.address_bits < MIN_ADDRESS_BITS || self.address_bits > MAX_ADDRESS_BITS {
            return err!(Usage, "address_bits must be in {}..={}, got {}", MIN_ADDRESS_BITS, MAX_ADDRESS_BITS, self.address_bits);
        }
        self.check_shape()
    }

    // The part of validate() that down-sampled configs must satisfy too. They may have fewer than MIN_ADDRESS_BITS.
    fn check_shape(&self) -> Result<()> {
        if self.page_bits % 2 != 0 || self.page_bits == 0 {
            return err!(Usage, "page_bits must be even and positive (a page is drawn as a square), got {}", self.page_bits);
        }
        if self.top_bits < self.page_bits {
            return err!(Usage, "top_bits ({}) must be at least page_bits ({})", self.top_bits, self.page_bits);
        }
        if self.address_bits < self.top_bits {
            return err!(Usage, "address_bits ({}) must be at least top_bits ({})", self.address_bits, self.top_bits);
        }
        if self.address_bits + self.ignore_bits > 64 {
            return err!(Usage, "address_bits + ignore_bits must be at most 64, got {} + {}", self.address_bits, self.ignore_bits);
        }
        Ok(())
    }

    pub fn num_units(&self) -> u64 { 1 << self.address_bits }
    pub fn num_pages(&self) -> u64 { 1 << (self.address_bits - self.page_bits) }
    pub fn num_tops(&self) -> u64 { 1 << (self.address_bits - self.top_bits) }
    pub fn page_size(&self) -> u64 { 1 << self.page_bits }
    // Side of the square tile a page is drawn as.
    pub fn page_side(&self) -> u64 { 1 << (self.page_bits / 2) }

    // Config of the store that down-sampling this one by `shift` produces.
    pub fn downsampled(&self, shift: u32) -> StoreConfig {
        let address_bits = self.address_bits - shift;
        StoreConfig {address_bits, ignore_bits: self.ignore_bits + shift, page_bits: self.page_bits, top_bits: self.top_bits.min(address_bits).max(self.page_bits)}
    }
}

// Per-unit state of a traced address space, see state.rs for the word format.
//
// One writer thread calls update_address(), set_range_exists(), increment_time(); any number of reader threads look at
// the words and existence bits at the same time, without locks. All accesses are relaxed atomics: readers may see a
// multi-unit write partially applied, or existence bits slightly ahead of the words, and that's fine for drawing.
//
// The words live in one huge lazily-committed mapping, indexed directly by unit address. Only pages that were touched
// (marked in `exists`) cost memory. `top_exists` has one bit per superregion of 2^top_bits units, to skip over big
// empty stretches quickly when iterating.
pub struct SparseAddressStore {
    pub config: StoreConfig,
    words: Reservation,
    exists: Vec<AtomicU64>,
    top_exists: Vec<AtomicU64>,
    page_count: AtomicUsize,
    clock: AtomicU32,
    dropped_events: AtomicUsize,
}

// Words of one existing page.
pub struct Page<'a> {
    pub index: u64,
    pub first_unit: u64,
    pub words: &'a [AtomicU32],
}

impl<'a> Page<'a> {
    pub fn offset_of(&self, unit: u64) -> usize {
        debug_assert!(unit >= self.first_unit && unit - self.first_unit < self.words.len() as u64);
        (unit - self.first_unit) as usize
    }

    pub fn get(&self, offset: usize) -> StateWord {
        StateWord(self.words[offset].load(Ordering::Relaxed))
    }
}

#[derive(Clone, Debug)]
pub struct AddressInfo {
    pub addr: u64,
    pub unit: u64,
    pub in_range: bool,
    pub page_exists: bool,
    pub word: StateWord,
    pub clock: u32,
}

impl AddressInfo {
    pub fn age(&self) -> Option<u32> { self.word.age(self.clock) }
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.addr)?;
        if !self.in_range {
            return write!(f, " (out of range)");
        }
        if !self.page_exists || !self.word.is_touched() {
            return write!(f, " untouched");
        }
        let w = self.word;
        write!(f, " {}{}", if w.is_free() {"freed "} else {""}, w.kind().name())?;
        if w.dtype() != DataType::None {
            write!(f, " {}", w.dtype().name())?;
        }
        write!(f, " thread {}", w.thread())?;
        match self.age() {
            Some(a) => write!(f, ", {} ticks ago", a)?,
            None => write!(f, ", long ago")?,
        }
        if w.is_selected() {
            write!(f, " [selected]")?;
        }
        Ok(())
    }
}

fn bitmap(bits: u64) -> Vec<AtomicU64> {
    (0..(bits + 63) / 64).map(|_| AtomicU64::new(0)).collect()
}

impl SparseAddressStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Self::create(config)
    }

    fn create(config: StoreConfig) -> Result<Self> {
        config.check_shape()?;
        let words = Reservation::new((config.num_units() as usize) * 4)?;
        Ok(Self {config, words, exists: bitmap(config.num_pages()), top_exists: bitmap(config.num_tops()), page_count: AtomicUsize::new(0), clock: AtomicU32::new(TIME_BASE), dropped_events: AtomicUsize::new(0)})
    }

    // For stores we build ourselves from an already validated config. There's nothing sensible to do if that fails.
    fn create_or_abort(config: StoreConfig) -> Self {
        match Self::create(config) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("fatal: failed to create store {:?}: {}", config, e);
                std::process::abort();
            }
        }
    }

    pub fn clock(&self) -> u32 { self.clock.load(Ordering::Relaxed) }
    pub fn page_count(&self) -> usize { self.page_count.load(Ordering::Relaxed) }
    pub fn dropped_events(&self) -> usize { self.dropped_events.load(Ordering::Relaxed) }

    pub fn unit_of(&self, addr: u64) -> u64 { addr >> self.config.ignore_bits }
    pub fn addr_of(&self, unit: u64) -> u64 { unit << self.config.ignore_bits }

    // Byte range -> unit range, or None if it doesn't fit in the address space.
    fn unit_range(&self, addr: u64, size: u64) -> Option<(u64, u64)> {
        let last = self.unit_of(addr.saturating_add(size.max(1) - 1));
        if last >= self.config.num_units() {
            None
        } else {
            Some((self.unit_of(addr), last + 1))
        }
    }

    fn mark_exists(&self, start: u64, end: u64) {
        let pb = self.config.page_bits;
        for page in (start >> pb)..=((end - 1) >> pb) {
            let (w, b) = ((page / 64) as usize, 1u64 << (page % 64));
            // Almost always already set; avoid the atomic rmw in that case.
            if self.exists[w].load(Ordering::Relaxed) & b != 0 {
                continue;
            }
            if self.exists[w].fetch_or(b, Ordering::Relaxed) & b == 0 {
                self.page_count.fetch_add(1, Ordering::Relaxed);
            }
            let top = page >> (self.config.top_bits - pb);
            self.top_exists[(top / 64) as usize].fetch_or(1u64 << (top % 64), Ordering::Relaxed);
        }
    }

    // Records an event covering bytes [addr, addr + size). `bits` come from state::event_bits() or state::free_event_bits().
    // Events that don't fit in the address space are dropped and counted.
    pub fn update_address(&self, addr: u64, size: u64, bits: u32) {
        let (start, end) = match self.unit_range(addr, size) {
            Some(r) => r,
            None => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.mark_exists(start, end);
        let words = self.words.as_atomic_u32();
        let (s, e) = (start as usize, end as usize);
        if bits & FREE_BIT != 0 {
            for w in &words[s..e] {
                w.fetch_or(FREE_BIT, Ordering::Relaxed);
            }
            return;
        }
        let word = StateWord::new(self.clock(), bits).0;
        // The highlight belongs to the address, not to the event: keep it.
        let put = |w: &AtomicU32| w.store(word | (w.load(Ordering::Relaxed) & SELECTED_BIT), Ordering::Relaxed);
        match e - s {
            1 => put(&words[s]),
            2 => {
                put(&words[s]);
                put(&words[s + 1]);
            }
            _ => for w in &words[s..e] {
                put(w);
            }
        }
    }

    // For a store made by downsample(src, ..): after the writer changed the units of `src` covering bytes
    // [addr, addr + size), makes the cells over them the max of their units again.
    pub fn refresh_from(&self, src: &SparseAddressStore, addr: u64, size: u64) {
        let (start, end) = match src.unit_range(addr, size) { Some(r) => r, None => return };
        let shift = self.config.ignore_bits - src.config.ignore_bits;
        let (first, last) = (start >> shift, (end - 1) >> shift);
        self.mark_exists(first, last + 1);
        let (out, words) = (self.words.as_atomic_u32(), src.words.as_atomic_u32());
        for cell in first..=last {
            let (u0, u1) = (cell << shift, (cell + 1) << shift);
            let fresh = words[start.max(u0) as usize..end.min(u1) as usize].iter().map(|w| w.load(Ordering::Relaxed)).max().unwrap_or(0);
            let o = &out[cell as usize];
            if fresh >= o.load(Ordering::Relaxed) {
                o.store(fresh, Ordering::Relaxed);
            } else {
                // The old max may have been overwritten (same tick with a lower kind, or a word from before the clock
                // wrapped), so look at the whole cell.
                o.store(src.max_in(u0, u1), Ordering::Relaxed);
            }
        }
    }

    // Max word of units [start, end), looking only at existing pages.
    fn max_in(&self, start: u64, end: u64) -> u32 {
        let (pb, words) = (self.config.page_bits, self.words.as_atomic_u32());
        let mut it = self.display_iter();
        it.seek(start >> pb);
        let mut res = 0;
        for p in it.take_while(|&p| p << pb < end) {
            let (a, b) = ((p << pb).max(start), ((p + 1) << pb).min(end));
            res = words[a as usize..b as usize].iter().map(|w| w.load(Ordering::Relaxed)).fold(res, u32::max);
        }
        res
    }

    // Marks pages covering bytes [start, end) as occupied without touching their words, e.g. for a new mapping.
    pub fn set_range_exists(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        match self.unit_range(start, end - start) {
            Some((s, e)) => self.mark_exists(s, e),
            None => { self.dropped_events.fetch_add(1, Ordering::Relaxed); }
        }
    }

    // Sets or clears the highlight bit for bytes [start, end). Pages that don't exist are left alone.
    pub fn set_selected(&self, start: u64, end: u64, selected: bool) {
        if start >= end {
            return;
        }
        let end = self.unit_of(end - 1).saturating_add(1).min(self.config.num_units());
        let mut unit = self.unit_of(start);
        while unit < end {
            let page_end = ((unit >> self.config.page_bits) + 1) << self.config.page_bits;
            let chunk_end = page_end.min(end);
            if let Some(page) = self.page(unit) {
                for w in &page.words[page.offset_of(unit)..page.offset_of(chunk_end - 1) + 1] {
                    if selected {
                        w.fetch_or(SELECTED_BIT, Ordering::Relaxed);
                    } else {
                        w.fetch_and(!SELECTED_BIT, Ordering::Relaxed);
                    }
                }
            }
            unit = chunk_end;
        }
    }

    // Advances the clock by one tick. Twice per cycle, words (and stack trace entries) whose times would become
    // ambiguous are marked stale, see state::stale_predicate().
    pub fn increment_time(&self, stacks: Option<&IntervalMap<StackTraceEntry>>) {
        let mut clock = self.clock() + 1;
        if let Some(pred) = stale_predicate(clock) {
            let _prof = ProfileScope::with_threshold(0.05, format!("marking stale at clock {}", clock));
            self.mark_stale(pred);
            if let Some(stacks) = stacks {
                stacks.writer().apply(0, u64::MAX, |iv| if pred(iv.value.time) { iv.value.time = TIME_STALE; });
            }
        }
        if clock == FULL_LIFE {
            clock = TIME_BASE;
        }
        self.clock.store(clock, Ordering::Relaxed);
    }

    fn mark_stale(&self, pred: fn(u32) -> bool) {
        for p in self.display_iter() {
            let page = match self.page(p << self.config.page_bits) { Some(x) => x, None => continue };
            for w in page.words {
                let x = StateWord(w.load(Ordering::Relaxed));
                if pred(x.time()) {
                    w.store(x.with_time(TIME_STALE).0, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn page_exists(&self, page: u64) -> bool {
        page < self.config.num_pages() && self.exists[(page / 64) as usize].load(Ordering::Relaxed) & (1u64 << (page % 64)) != 0
    }

    pub fn page(&self, unit: u64) -> Option<Page<'_>> {
        let index = unit >> self.config.page_bits;
        if !self.page_exists(index) {
            return None;
        }
        let first_unit = index << self.config.page_bits;
        let words = &self.words.as_atomic_u32()[first_unit as usize..(first_unit + self.config.page_size()) as usize];
        Some(Page {index, first_unit, words})
    }

    // Word of any unit; zero (untouched) outside the address space.
    pub fn get(&self, unit: u64) -> StateWord {
        if unit >= self.config.num_units() {
            return StateWord::default();
        }
        StateWord(self.words.as_atomic_u32()[unit as usize].load(Ordering::Relaxed))
    }

    // Copies words of units [unit, unit + out.len()) into `out`, zeros past the end of the address space.
    pub fn get_range(&self, unit: u64, out: &mut [u32]) {
        let n = self.config.num_units();
        let words = self.words.as_atomic_u32();
        for (i, o) in out.iter_mut().enumerate() {
            let u = unit + i as u64;
            *o = if u < n {words[u as usize].load(Ordering::Relaxed)} else {0};
        }
    }

    pub fn address_info(&self, addr: u64) -> AddressInfo {
        let unit = self.unit_of(addr);
        let in_range = unit < self.config.num_units();
        let page_exists = in_range && self.page_exists(unit >> self.config.page_bits);
        AddressInfo {addr, unit, in_range, page_exists, word: if page_exists {self.get(unit)} else {StateWord::default()}, clock: self.clock()}
    }

    // Occupied pages in ascending order.
    pub fn display_iter(&self) -> DisplayIterator<'_> {
        DisplayIterator {store: self, next: 0}
    }

    // Roughly how much memory the store uses: committed words plus the bitmaps.
    pub fn memory_usage(&self) -> usize {
        self.page_count() * self.config.page_size() as usize * 4 + (self.exists.len() + self.top_exists.len()) * 8
    }

    // Builds a store with 2^shift times fewer units, where each unit holds the max of the corresponding 2^shift units of `src`.
    // Pages are processed on `executor` in batches of `batch_pages`; returns after all batches are done.
    pub fn downsample(src: &Arc<SparseAddressStore>, shift: u32, executor: &Executor, batch_pages: usize) -> Arc<SparseAddressStore> {
        assert!(shift > 0 && src.config.address_bits - shift >= src.config.page_bits, "bad down-sample shift {} for {:?}", shift, src.config);
        let dst = Arc::new(Self::create_or_abort(src.config.downsampled(shift)));
        let group = TaskGroup::new();
        let mut pages: Vec<u64> = Vec::with_capacity(batch_pages);
        for p in src.display_iter() {
            pages.push(p);
            if pages.len() >= batch_pages.max(1) {
                Self::add_downsample_task(src, &dst, shift, std::mem::take(&mut pages), executor, &group);
            }
        }
        if !pages.is_empty() {
            Self::add_downsample_task(src, &dst, shift, pages, executor, &group);
        }
        group.wait();
        dst.clock.store(src.clock(), Ordering::Relaxed);
        dst
    }

    fn add_downsample_task(src: &Arc<SparseAddressStore>, dst: &Arc<SparseAddressStore>, shift: u32, pages: Vec<u64>, executor: &Executor, group: &TaskGroup) {
        let (src, dst) = (src.clone(), dst.clone());
        executor.add_to_group(group, move || {
            let group_size = 1usize << shift.min(src.config.page_bits);
            let out = dst.words.as_atomic_u32();
            for p in pages {
                let page = match src.page(p << src.config.page_bits) { Some(x) => x, None => continue };
                let first_out = page.first_unit >> shift;
                let last_out = (page.first_unit + src.config.page_size() - 1) >> shift;
                dst.mark_exists(first_out, last_out + 1);
                for (i, chunk) in page.words.chunks(group_size).enumerate() {
                    let m = chunk.iter().map(|w| w.load(Ordering::Relaxed)).max().unwrap_or(0);
                    if m != 0 {
                        let u = (page.first_unit + (i * group_size) as u64) >> shift;
                        out[u as usize].fetch_max(m, Ordering::Relaxed);
                    }
                }
            }
        });
    }
}

// Lazily walks occupied page indices in ascending order. Cost is proportional to the number of bitmap words
// looked at, so empty superregions are skipped 64 at a time. Can be restarted from any page with seek().
pub struct DisplayIterator<'a> {
    store: &'a SparseAddressStore,
    next: u64,
}

impl<'a> DisplayIterator<'a> {
    pub fn seek(&mut self, page: u64) {
        self.next = page;
    }
}

impl<'a> Iterator for DisplayIterator<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let c = &self.store.config;
        let (total, top_shift) = (c.num_pages(), c.top_bits - c.page_bits);
        loop {
            if self.next >= total {
                return None;
            }
            let top = self.next >> top_shift;
            let tw = top / 64;
            let tbits = self.store.top_exists[tw as usize].load(Ordering::Relaxed) & (!0u64 << (top % 64));
            if tbits == 0 {
                self.next = ((tw + 1) * 64) << top_shift;
                continue;
            }
            let t = tw * 64 + tbits.trailing_zeros() as u64;
            if t != top {
                self.next = t << top_shift;
            }
            let region_end = (t + 1) << top_shift;
            let w = self.next / 64;
            let bits = self.store.exists[w as usize].load(Ordering::Relaxed) & (!0u64 << (self.next % 64));
            if bits != 0 {
                let p = w * 64 + bits.trailing_zeros() as u64;
                if p < region_end {
                    self.next = p + 1;
                    return Some(p);
                }
            }
            self.next = ((w + 1) * 64).min(region_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, store::*, state::*, executor::*, interval_map::*, tracker::*};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::BTreeSet;

    fn small(address_bits: u32, page_bits: u32, top_bits: u32) -> SparseAddressStore {
        SparseAddressStore::new(StoreConfig {address_bits, ignore_bits: 0, page_bits, top_bits}).unwrap()
    }

    #[test]
    fn update_and_read_back() {
        let s = SparseAddressStore::new(StoreConfig {address_bits: 20, ignore_bits: 2, page_bits: 4, top_bits: 8}).unwrap();
        assert_eq!(s.page_count(), 0);
        s.update_address(0x1000, 4, event_bits(AccessKind::Write, 3, DataType::Int32));
        assert_eq!(s.page_count(), 1);
        let info = s.address_info(0x1000);
        assert!(info.page_exists);
        assert_eq!(info.unit, 0x400);
        assert_eq!(info.word.kind(), AccessKind::Write);
        assert_eq!(info.word.thread(), 3);
        assert_eq!(info.word.dtype(), DataType::Int32);
        assert_eq!(info.word.time(), s.clock());
        assert_eq!(info.age(), Some(0));
        // Neighbors in the same page are untouched.
        assert!(!s.address_info(0x1004).word.is_touched());
        assert!(s.address_info(0x1004).page_exists);

        let page = s.page(0x400).unwrap();
        assert_eq!(page.index, 0x40);
        assert_eq!(page.offset_of(0x401), 1);
        assert_eq!(page.get(0).kind(), AccessKind::Write);
        assert!(s.page(0x410).is_none());

        // Multi-unit write spanning a page boundary.
        s.increment_time(None);
        s.update_address(0x103c, 8, event_bits(AccessKind::Read, 1, DataType::Float64));
        assert_eq!(s.page_count(), 2);
        assert_eq!(s.get(0x40f).kind(), AccessKind::Read);
        assert_eq!(s.get(0x410).kind(), AccessKind::Read);
        assert_eq!(s.get(0x410).time(), TIME_BASE + 1);

        // Freeing keeps everything but sets the flag.
        s.update_address(0x1000, 4, free_event_bits());
        let w = s.get(0x400);
        assert!(w.is_free());
        assert_eq!(w.kind(), AccessKind::Write);
        assert_eq!(w.time(), TIME_BASE);

        s.set_selected(0x1000, 0x1008, true);
        assert!(s.get(0x400).is_selected() && s.get(0x401).is_selected() && !s.get(0x402).is_selected());
        s.set_selected(0x1000, 0x1008, false);
        assert!(!s.get(0x400).is_selected());
        assert!(format!("{}", s.address_info(0x1000)).contains("freed write"));

        // Highlighting survives later accesses, and isn't spread by them.
        s.set_selected(0x1004, 0x1008, true);
        s.increment_time(None);
        s.update_address(0x1000, 12, event_bits(AccessKind::Read, 2, DataType::None));
        assert!(!s.get(0x400).is_selected() && s.get(0x401).is_selected() && !s.get(0x402).is_selected());
        assert_eq!(s.get(0x401).kind(), AccessKind::Read);
        assert_eq!(s.get(0x401).time(), s.clock());
        s.update_address(0x1004, 1, event_bits(AccessKind::Write, 2, DataType::None));
        assert!(s.get(0x401).is_selected());
    }

    #[test]
    fn out_of_range_dropped() {
        let s = small(16, 4, 8);
        s.update_address(0xffff, 1, event_bits(AccessKind::Read, 0, DataType::None));
        assert_eq!(s.dropped_events(), 0);
        s.update_address(0x10000, 1, event_bits(AccessKind::Read, 0, DataType::None));
        s.update_address(0xfffe, 4, event_bits(AccessKind::Read, 0, DataType::None));
        s.update_address(u64::MAX, 100, event_bits(AccessKind::Read, 0, DataType::None));
        assert_eq!(s.dropped_events(), 3);
        assert_eq!(s.page_count(), 1);
        assert!(!s.address_info(0x10000).in_range);
        assert_eq!(s.get(0x10000), StateWord::default());
    }

    #[test]
    fn bad_configs() {
        let usage = |c: StoreConfig| SparseAddressStore::new(c).err().map_or(false, |e| e.is_usage());
        assert!(usage(StoreConfig {address_bits: 20, ignore_bits: 0, page_bits: 5, top_bits: 8}));
        assert!(usage(StoreConfig {address_bits: 41, ignore_bits: 0, page_bits: 4, top_bits: 8}));
        assert!(usage(StoreConfig {address_bits: 20, ignore_bits: 0, page_bits: 10, top_bits: 8}));
        assert!(usage(StoreConfig {address_bits: 30, ignore_bits: 40, page_bits: 4, top_bits: 8}));
        assert!(!usage(StoreConfig {address_bits: 20, ignore_bits: 0, page_bits: 4, top_bits: 8}));
    }

    #[test]
    fn clock_wraparound() {
        let s = small(16, 4, 8);
        let stacks: IntervalMap<StackTraceEntry> = IntervalMap::new();
        let write = event_bits(AccessKind::Write, 0, DataType::None);
        s.update_address(0x10, 1, write);
        stacks.writer().insert(0x10, 0x20, StackTraceEntry {trace_id: 7, time: s.clock()});
        while s.clock() < HALF_LIFE - 1 {
            s.increment_time(Some(&stacks));
        }
        s.increment_time(Some(&stacks));
        assert_eq!(s.clock(), HALF_LIFE);
        // Early lower-half times survive the half-life mark.
        assert_eq!(s.get(0x10).time(), TIME_BASE);
        assert_eq!(stacks.reader().find(0x10).unwrap().value.time, TIME_BASE);

        s.increment_time(Some(&stacks));
        s.update_address(0x20, 1, write);
        let late = s.get(0x20).time();
        assert_eq!(late, HALF_LIFE + 1);
        while s.clock() != TIME_BASE {
            s.increment_time(Some(&stacks));
        }
        // Wrapped: lower-half times are stale now, upper-half ones are still live with the right age.
        assert!(s.get(0x10).is_stale());
        assert_eq!(s.get(0x10).kind(), AccessKind::Write);
        assert_eq!(stacks.reader().find(0x10).unwrap().value.time, TIME_STALE);
        assert_eq!(s.get(0x20).time(), late);
        assert_eq!(s.get(0x20).age(s.clock()), Some(FULL_LIFE - late));
        assert_eq!(s.address_info(0x20).age(), Some(FULL_LIFE - late));

        // Next half-life mark gets rid of it too.
        while s.clock() != HALF_LIFE {
            s.increment_time(None);
        }
        assert!(s.get(0x20).is_stale());
        assert!(!s.get(0x30).is_touched());
    }

    #[test]
    fn iterator_skips() {
        let s = small(32, 12, 20);
        let pages: Vec<u64> = vec![0, 1, 63, 64, 4095, 4096, 1 << 18, (1 << 20) - 1];
        for &p in &pages {
            s.set_range_exists(p << 12, (p << 12) + 1);
        }
        assert_eq!(s.page_count(), pages.len());
        assert_eq!(s.display_iter().collect::<Vec<u64>>(), pages);
        let mut it = s.display_iter();
        it.seek(65);
        assert_eq!(it.next(), Some(4095));
        assert_eq!(small(20, 4, 8).display_iter().next(), None);
    }

    #[test]
    fn iterator_random() {
        let mut rng = StdRng::seed_from_u64(42);
        for &(address_bits, page_bits, top_bits) in &[(20, 4, 6), (20, 2, 16), (18, 4, 4), (16, 8, 16)] {
            let s = small(address_bits, page_bits, top_bits);
            let mut model: BTreeSet<u64> = BTreeSet::new();
            for _ in 0..200 {
                let addr = rng.gen_range(0..1u64 << address_bits);
                let size = rng.gen_range(1..100u64).min((1u64 << address_bits) - addr);
                s.set_range_exists(addr, addr + size);
                for p in (addr >> page_bits)..=((addr + size - 1) >> page_bits) {
                    model.insert(p);
                }
                assert_eq!(s.page_count(), model.len());
            }
            assert_eq!(s.display_iter().collect::<Vec<u64>>(), model.iter().copied().collect::<Vec<u64>>());
        }
    }

    #[test]
    fn downsample_takes_max() {
        let src = Arc::new(small(20, 4, 8));
        let mut rng = StdRng::seed_from_u64(7);
        let kinds = [AccessKind::Alloc, AccessKind::Instruction, AccessKind::Write, AccessKind::Read];
        for _ in 0..2000 {
            if rng.gen_range(0..10) == 0 {
                src.increment_time(None);
            }
            let addr = rng.gen_range(0..4096u64) + if rng.gen_bool(0.5) {0x80000} else {0};
            src.update_address(addr, 1, event_bits(kinds[rng.gen_range(0..4)], rng.gen_range(0..4), DataType::None));
        }
        let exec = Executor::new(3);
        for shift in [1, 2, 4, 6] {
            let dst = SparseAddressStore::downsample(&src, shift, &exec, 3);
            assert_eq!(dst.config.address_bits, 20 - shift);
            assert_eq!(dst.config.ignore_bits, shift);
            assert_eq!(dst.clock(), src.clock());
            for out in 0..(1u64 << (20 - shift)) {
                let expected = (out << shift..(out + 1) << shift).map(|u| src.get(u)).max().unwrap();
                assert_eq!(dst.get(out), expected, "shift {} unit {:x}", shift, out);
            }
            // Byte addresses mean the same thing in both stores.
            assert_eq!(dst.address_info(0x80000 + 5).unit, (0x80000 + 5) >> shift);
            let occupied: BTreeSet<u64> = src.display_iter().map(|p| (p << 4 >> shift) >> 4).collect();
            assert_eq!(dst.display_iter().collect::<BTreeSet<u64>>(), occupied);
        }
        // Inline executor gives the same result.
        let a = SparseAddressStore::downsample(&src, 2, &Executor::invalid(), 1);
        let b = SparseAddressStore::downsample(&src, 2, &exec, 100);
        for u in 0..(1u64 << 18) {
            assert_eq!(a.get(u), b.get(u));
        }
    }
}
