use crate::{*, error::*, store::*, state::*, settings::*, executor::*, interval_map::*, log::*, util::*};
use std::{fmt, sync::{Arc, Mutex}};
use bitflags::*;

bitflags! { pub struct MapPermissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
}}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MMapRegion {
    pub name: String,
    pub perms: MapPermissions,
}

// Which stack trace allocated a heap range, and when. `time` is on the store's clock and goes stale with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackTraceEntry {
    pub trace_id: u64,
    pub time: u32,
}

// Parses /proc/<pid>/maps-style text: "start-end perms offset dev inode [path]", addresses in hex.
pub fn parse_maps(text: &str) -> Result<Vec<(u64, u64, MMapRegion)>> {
    let mut res = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut s = line.split_whitespace();
        let (range, perms) = match (s.next(), s.next()) {
            (Some(r), Some(p)) => (r, p),
            _ => return err!(Format, "too few fields in maps line: {}", line),
        };
        let (start, end) = match range.split_once('-') {
            Some(x) => x,
            None => return err!(Format, "bad range in maps line: {}", line),
        };
        let start = u64::from_str_radix(start, 16)?;
        let end = u64::from_str_radix(end, 16)?;
        if start >= end {
            return err!(Format, "empty range in maps line: {}", line);
        }
        let mut permissions = MapPermissions::empty();
        for ch in perms.chars() {
            match ch {
                'r' => permissions.insert(MapPermissions::READ),
                'w' => permissions.insert(MapPermissions::WRITE),
                'x' => permissions.insert(MapPermissions::EXECUTE),
                's' => permissions.insert(MapPermissions::SHARED),
                'p' => permissions.insert(MapPermissions::PRIVATE),
                _ => (),
            }
        }
        // Skip range, perms, offset, dev, inode; whatever is left is the name (may contain spaces, or be absent).
        let mut rest = line.trim_start();
        for _ in 0..5 {
            rest = match rest.split_once(char::is_whitespace) {
                Some((_, r)) => r.trim_start(),
                None => "",
            };
        }
        let name = rest.trim_end().to_string();
        res.push((start, end, MMapRegion {name, perms: permissions}));
    }
    Ok(res)
}

struct TrackerShared {
    base: Arc<SparseAddressStore>,
    // Store the renderer should draw from, and its shift relative to `base`. Replaced as a whole on zoom change.
    current: Mutex<(u32, Arc<SparseAddressStore>)>,
    // Latest zoom request not yet applied by the writer. Newer requests overwrite older ones.
    pending_zoom: Mutex<Option<u32>>,
    mmaps: IntervalMap<MMapRegion>,
    stacks: IntervalMap<StackTraceEntry>,
}

// Writer side: owned by the thread that ingests events. Applies them to the base store and to the current
// down-sampled store (if zoomed out), keeps the maps, and switches zoom levels when asked.
pub struct Tracker {
    pub log: Log,
    base: Arc<SparseAddressStore>,
    mipmap: Option<(u32, Arc<SparseAddressStore>)>,
    executor: Executor,
    shared: Arc<TrackerShared>,
    max_shift: u32,
    batch_pages: usize,
    slow_log_secs: f64,
    limiter: Limiter,
    reported_dropped: usize,
}

// Renderer side. Cheap to clone, can be sent to other threads.
#[derive(Clone)]
pub struct TrackerView {
    shared: Arc<TrackerShared>,
}

#[derive(Clone, Debug)]
pub struct TrackerAddressInfo {
    pub store: AddressInfo,
    pub mmap: Option<Interval<MMapRegion>>,
    pub stack: Option<Interval<StackTraceEntry>>,
}

impl fmt::Display for TrackerAddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.store)?;
        if let Some(m) = &self.mmap {
            write!(f, " in {:x}-{:x}", m.start, m.end)?;
            if !m.value.name.is_empty() {
                write!(f, " {}", m.value.name)?;
            }
        }
        if let Some(s) = &self.stack {
            write!(f, ", allocated by trace {} ({} bytes at {:x})", s.value.trace_id, s.len(), s.start)?;
        }
        Ok(())
    }
}

impl Tracker {
    pub fn new(settings: &Settings) -> Result<(Tracker, TrackerView)> {
        settings.validate()?;
        let config = settings.store_config();
        let base = Arc::new(SparseAddressStore::new(config)?);
        let shared = Arc::new(TrackerShared {base: base.clone(), current: Mutex::new((0, base.clone())), pending_zoom: Mutex::new(None), mmaps: IntervalMap::new(), stacks: IntervalMap::new()});
        let tracker = Tracker {log: Log::new(), base, mipmap: None, executor: Executor::new(settings.worker_threads), shared: shared.clone(), max_shift: config.address_bits - config.page_bits, batch_pages: settings.downsample_batch_pages, slow_log_secs: settings.log_slow_ops_secs, limiter: Limiter::new(), reported_dropped: 0};
        Ok((tracker, TrackerView {shared}))
    }

    pub fn base(&self) -> &Arc<SparseAddressStore> { &self.base }
    pub fn shift(&self) -> u32 { self.mipmap.as_ref().map_or(0, |m| m.0) }

    pub fn update_address(&mut self, addr: u64, size: u64, bits: u32) {
        self.base.update_address(addr, size, bits);
        if let Some((_, m)) = &self.mipmap {
            m.refresh_from(&self.base, addr, size);
        }
    }

    pub fn set_range_exists(&mut self, start: u64, end: u64) {
        self.base.set_range_exists(start, end);
        if let Some((_, m)) = &self.mipmap {
            m.set_range_exists(start, end);
        }
    }

    pub fn increment_time(&mut self) {
        let sweep = stale_predicate(self.base.clock() + 1).is_some();
        self.base.increment_time(Some(&self.shared.stacks));
        if let Some((shift, m)) = self.mipmap.clone() {
            if sweep {
                // Marking stale doesn't commute with taking the max, so build the mipmap again from the swept base.
                self.switch_zoom(shift);
            } else {
                m.increment_time(None);
            }
        }
        let dropped = self.base.dropped_events();
        if dropped > self.reported_dropped {
            if self.limiter.check_n(line!(), 10) {
                eprintln!("warning: dropped {} events outside the {}-bit address space", PrettyCount(dropped - self.reported_dropped), self.base.config.address_bits + self.base.config.ignore_bits);
            }
            self.reported_dropped = dropped;
        }
    }

    pub fn insert_mmap(&mut self, start: u64, end: u64, region: MMapRegion) {
        self.shared.mmaps.writer().insert(start, end, region);
    }

    pub fn erase_mmap(&mut self, start: u64, end: u64) {
        self.shared.mmaps.writer().erase(start, end);
    }

    // Replaces all mappings with the ones parsed from /proc/<pid>/maps-style text. Mapped ranges become visible even if
    // nothing touched them yet; ranges outside the address space (e.g. [vsyscall]) are only recorded in the map.
    pub fn load_maps(&mut self, text: &str) -> Result<usize> {
        let maps = parse_maps(text)?;
        {
            let mut w = self.shared.mmaps.writer();
            w.clear();
            for (start, end, region) in &maps {
                w.insert(*start, *end, region.clone());
            }
        }
        for &(start, end, _) in &maps {
            if self.base.unit_of(end - 1) < self.base.config.num_units() {
                self.set_range_exists(start, end);
            }
        }
        Ok(maps.len())
    }

    pub fn insert_stack_trace(&mut self, start: u64, end: u64, trace_id: u64) {
        let time = self.base.clock();
        self.shared.stacks.writer().insert(start, end, StackTraceEntry {trace_id, time});
    }

    // Modifies stack trace entries in [start, end), splitting entries that stick out.
    pub fn apply_to_range<F: FnMut(&mut Interval<StackTraceEntry>)>(&mut self, start: u64, end: u64, f: F) {
        self.shared.stacks.writer().apply(start, end, f);
    }

    // Call between batches of events. Applies the latest zoom request, if any. Returns true if the zoom changed.
    pub fn poll(&mut self) -> bool {
        let requested = match self.shared.pending_zoom.lock().unwrap().take() {
            Some(z) => z.min(self.max_shift),
            None => return false,
        };
        if requested == self.shift() {
            return false;
        }
        let store = self.switch_zoom(requested);
        log!(self.log, "zoom {}: {} pages, {}", requested, PrettyCount(store.page_count()), PrettySize(store.memory_usage()));
        true
    }

    // Builds the store for `shift` (the base one for 0) and publishes it to the views.
    fn switch_zoom(&mut self, shift: u32) -> Arc<SparseAddressStore> {
        // Drop the old mipmap first, its memory may be needed for the new one.
        self.mipmap = None;
        let store = if shift == 0 {
            self.base.clone()
        } else {
            let prof = ProfileScope::with_threshold(self.slow_log_secs, format!("down-sampling {} pages by {}", self.base.page_count(), shift));
            let m = SparseAddressStore::downsample(&self.base, shift, &self.executor, self.batch_pages);
            drop(prof);
            self.mipmap = Some((shift, m.clone()));
            m
        };
        *self.shared.current.lock().unwrap() = (shift, store.clone());
        store
    }
}

impl TrackerView {
    // Takes effect on the writer's next poll(). Only the latest request counts.
    pub fn request_zoom(&self, shift: u32) {
        *self.shared.pending_zoom.lock().unwrap() = Some(shift);
    }

    pub fn current(&self) -> (u32, Arc<SparseAddressStore>) {
        self.shared.current.lock().unwrap().clone()
    }

    pub fn base(&self) -> &Arc<SparseAddressStore> { &self.shared.base }
    pub fn mmaps(&self) -> &IntervalMap<MMapRegion> { &self.shared.mmaps }
    pub fn stacks(&self) -> &IntervalMap<StackTraceEntry> { &self.shared.stacks }

    // Looks at the base store, so the answer is exact whatever the zoom.
    pub fn address_info(&self, addr: u64) -> TrackerAddressInfo {
        let store = self.shared.base.address_info(addr);
        let mmap = self.shared.mmaps.reader().find(addr).cloned();
        let stack = self.shared.stacks.reader().find(addr).cloned();
        TrackerAddressInfo {store, mmap, stack}
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, tracker::*, settings::*, state::*, layout::*, source::*, error::*, store::*, executor::*};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.address_bits = 24;
        s.page_bits = 6;
        s.top_bits = 12;
        s.worker_threads = 2;
        s.downsample_batch_pages = 2;
        s
    }

    #[test]
    fn zoom_switching() {
        let (mut t, view) = Tracker::new(&settings()).unwrap();
        let w = event_bits(AccessKind::Write, 1, DataType::None);
        let r = event_bits(AccessKind::Read, 1, DataType::None);
        for i in 0..100u64 {
            t.update_address(0x10000 + i * 8, 8, w);
        }
        assert!(!t.poll());
        assert_eq!(view.current().0, 0);
        assert!(Arc::ptr_eq(&view.current().1, view.base()));

        // Last request wins.
        view.request_zoom(5);
        view.request_zoom(2);
        assert!(t.poll());
        assert!(!t.poll());
        let (shift, m) = view.current();
        assert_eq!(shift, 2);
        assert_eq!(m.config.ignore_bits, 2);
        assert_eq!(m.get(m.unit_of(0x10000)).kind(), AccessKind::Write);
        assert!(t.log.last().unwrap().starts_with("zoom 2:"));

        // New events go to both stores.
        t.increment_time();
        t.update_address(0x20000, 1, r);
        assert_eq!(m.get(m.unit_of(0x20000)).kind(), AccessKind::Read);
        assert_eq!(m.clock(), t.base().clock());
        assert_eq!(m.page_count(), SparseAddressStore::downsample(t.base(), 2, &Executor::invalid(), 1).page_count());

        // A renderer still holding the old store keeps a consistent view of it.
        view.request_zoom(1000);
        assert!(t.poll());
        let (shift, m2) = view.current();
        assert_eq!(shift, 24 - 6);
        assert_eq!(m.config.address_bits, 22);
        assert_eq!(m2.config.address_bits, 6);

        view.request_zoom(0);
        assert!(t.poll());
        assert!(Arc::ptr_eq(&view.current().1, view.base()));
        assert_eq!(t.shift(), 0);
    }

    fn assert_mipmap_matches(t: &Tracker, view: &TrackerView) {
        let (shift, m) = view.current();
        let expected = SparseAddressStore::downsample(t.base(), shift, &Executor::invalid(), 4);
        for u in 0..m.config.num_units() {
            assert_eq!(m.get(u), expected.get(u), "unit {:x}", u);
        }
        assert_eq!(m.display_iter().collect::<Vec<u64>>(), expected.display_iter().collect::<Vec<u64>>());
    }

    #[test]
    fn mipmap_follows_base() {
        let (mut t, view) = Tracker::new(&settings()).unwrap();
        let ev = |k| event_bits(k, 0, DataType::None);
        t.update_address(0x1000, 1, ev(AccessKind::Write));
        view.request_zoom(4);
        assert!(t.poll());

        // Same tick: an alloc next to a read doesn't hide it.
        t.update_address(0x1000, 1, ev(AccessKind::Read));
        t.update_address(0x1008, 1, ev(AccessKind::Alloc));
        assert_eq!(view.current().1.get(0x100).kind(), AccessKind::Read);
        // Same unit overwritten with a lower kind in the same tick.
        t.update_address(0x1000, 1, ev(AccessKind::Alloc));
        assert_mipmap_matches(&t, &view);

        // Freeing an old unit doesn't mark a newer neighbor freed.
        t.update_address(0x2000, 1, ev(AccessKind::Write));
        t.increment_time();
        t.update_address(0x2008, 1, ev(AccessKind::Read));
        t.update_address(0x2000, 1, free_event_bits());
        let w = view.current().1.get(0x200);
        assert_eq!((w.kind(), w.is_free()), (AccessKind::Read, false));
        assert_mipmap_matches(&t, &view);

        let mut rng = StdRng::seed_from_u64(3);
        let kinds = [AccessKind::Alloc, AccessKind::Instruction, AccessKind::Write, AccessKind::Read];
        for i in 0..3000 {
            let addr = rng.gen_range(0..0x40000u64);
            let size = rng.gen_range(1..40u64);
            if rng.gen_range(0..8) == 0 {
                t.update_address(addr, size, free_event_bits());
            } else {
                t.update_address(addr, size, event_bits(kinds[rng.gen_range(0..4)], rng.gen_range(0..3), DataType::None));
            }
            if i % 50 == 0 {
                t.increment_time();
            }
        }
        assert_mipmap_matches(&t, &view);

        // Crossing the half-life mark marks words stale and rebuilds the mipmap.
        let before = view.current().1;
        while t.base().clock() != HALF_LIFE {
            t.increment_time();
        }
        assert!(!Arc::ptr_eq(&before, &view.current().1));
        assert_eq!(view.current().0, 4);
        t.update_address(0x3000, 4, ev(AccessKind::Write));
        assert_mipmap_matches(&t, &view);
    }

    #[test]
    fn maps_and_stacks() {
        let (mut t, view) = Tracker::new(&settings()).unwrap();
        let n = t.load_maps("10000-20000 r-xp 00000000 08:01 1234   /usr/bin/thing with spaces\n\
                             20000-30000 rw-p 00000000 00:00 0\n").unwrap();
        assert_eq!(n, 2);
        assert!(t.base().page_exists(0x10000 >> 6) && t.base().page_exists((0x30000 >> 6) - 1));
        assert!(!t.base().page_exists(0x30000 >> 6));
        assert_eq!(t.base().page_count(), 0x20000 >> 6);
        let m = view.mmaps().reader().find(0x10010).cloned().unwrap();
        assert_eq!(m.value.name, "/usr/bin/thing with spaces");
        assert_eq!(m.value.perms, MapPermissions::READ | MapPermissions::EXECUTE | MapPermissions::PRIVATE);
        assert_eq!(view.mmaps().reader().find(0x25000).unwrap().value.name, "");
        t.erase_mmap(0x28000, 0x30000);
        assert!(view.mmaps().reader().find(0x29000).is_none());
        t.insert_mmap(0x28000, 0x29000, MMapRegion {name: "[heap]".to_string(), perms: MapPermissions::READ | MapPermissions::WRITE});
        assert_eq!(view.mmaps().reader().total_interval(), (0x10000, 0x29000));

        t.update_address(0x28010, 16, event_bits(AccessKind::Alloc, 0, DataType::None));
        t.insert_stack_trace(0x28010, 0x28020, 77);
        t.apply_to_range(0x28018, 0x28020, |iv| iv.value.trace_id = 78);
        let info = view.address_info(0x2801c);
        assert_eq!(info.store.word.kind(), AccessKind::Alloc);
        assert_eq!(info.mmap.as_ref().unwrap().value.name, "[heap]");
        assert_eq!(info.stack.as_ref().unwrap().value.trace_id, 78);
        assert_eq!(view.address_info(0x28010).stack.unwrap().value.trace_id, 77);
        let s = format!("{}", info);
        assert!(s.contains("[heap]") && s.contains("trace 78"));

        assert_eq!(parse_maps("zzz r-xp").unwrap_err().code(), Some(ErrorCode::Format));
        assert!(parse_maps("10-zz r-xp 0 0 0").is_err());
        assert!(parse_maps("20-10 r-xp 0 0 0").is_err());
        assert!(t.load_maps("bad").is_err());
    }

    #[test]
    fn dropped_events_reported() {
        let (mut t, _view) = Tracker::new(&settings()).unwrap();
        t.update_address(1 << 30, 4, event_bits(AccessKind::Read, 0, DataType::None));
        t.increment_time();
        assert_eq!(t.base().dropped_events(), 1);
        assert_eq!(t.reported_dropped, 1);
    }

    // Renderer thread draws from whatever store is current while the writer keeps going.
    #[test]
    fn concurrent_render() {
        let (mut t, view) = Tracker::new(&settings()).unwrap();
        let v = view.clone();
        let renderer = std::thread::spawn(move || {
            let mut layout = DisplayLayout::new(&Settings::default());
            let mut frames = 0;
            while frames < 50 {
                let (shift, store) = v.current();
                layout.update(&store, 256, 0, 0);
                let (w, h) = layout.content_size();
                let mut img: Image<StateWord> = Image::new(w.min(512) as usize, h.min(512) as usize);
                layout.fill_image(&mut img, &StateSource::new(&store, 0), 0, 0);
                if shift == 0 {
                    v.request_zoom(1);
                } else {
                    v.request_zoom(0);
                }
                frames += 1;
            }
        });
        for i in 0..20000u64 {
            t.update_address((i * 4099) % (1 << 22), 4, event_bits(AccessKind::Write, (i % 7) as u32, DataType::Int32));
            if i % 100 == 0 {
                t.increment_time();
                t.poll();
            }
        }
        renderer.join().unwrap();
        assert!(t.base().page_count() > 0);
    }
}
