use crate::{*, store::*, curve::*, source::*, settings::*, log::*};

// How occupied address ranges are arranged in 2D.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutMode {
    // Rows of fixed width, like a hex dump.
    Linear,
    // Quadtree with quarters in row-major order.
    Block,
    // Quadtree with quarters in Hilbert order.
    Hilbert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Stale,
    Computing,
    Valid,
}

// Half-open: [x0, x1) x [y0, y1).
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct Rect {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}
impl Rect {
    pub fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self { Self {x0, y0, x1, y1} }

    pub fn lo(&self, axis: usize) -> i64 { if axis == 0 {self.x0} else {self.y0} }
    pub fn hi(&self, axis: usize) -> i64 { if axis == 0 {self.x1} else {self.y1} }
    pub fn set_axis(&mut self, axis: usize, lo: i64, hi: i64) {
        if axis == 0 { self.x0 = lo; self.x1 = hi; } else { self.y0 = lo; self.y1 = hi; }
    }

    pub fn width(&self) -> i64 { self.x1 - self.x0 }
    pub fn height(&self) -> i64 { self.y1 - self.y0 }
    pub fn is_empty(&self) -> bool { self.x0 >= self.x1 || self.y0 >= self.y1 }
    pub fn contains(&self, x: i64, y: i64) -> bool { x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1 }
    pub fn contains_rect(&self, r: &Rect) -> bool { r.x0 >= self.x0 && r.x1 <= self.x1 && r.y0 >= self.y0 && r.y1 <= self.y1 }
    pub fn intersects(&self, r: &Rect) -> bool { self.x0 < r.x1 && r.x0 < self.x1 && self.y0 < r.y1 && r.y0 < self.y1 }

    pub fn union(&self, r: &Rect) -> Rect {
        Rect::new(self.x0.min(r.x0), self.y0.min(r.y0), self.x1.max(r.x1), self.y1.max(r.y1))
    }
}

// A contiguous range of cells and where it's drawn.
// Cells are store units shifted right by the positive zoom; see source.rs.
#[derive(Clone, Debug)]
pub struct DisplayBlock {
    pub address: u64,
    pub size: u64,
    // Position on the full curve (or in the full rows of Linear mode), in cells.
    pub bbox: Rect,
    // Position after compaction, in pixels. Same shape as bbox, scaled by the magnification.
    pub display: Rect,
}

impl DisplayBlock {
    pub fn end(&self) -> u64 { self.address + self.size }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LayoutKey {
    config: StoreConfig,
    page_count: usize,
    window_width: usize,
    content_width: usize,
    zoom: i32,
    mode: LayoutMode,
    compact: bool,
}

// Turns the set of occupied pages of a store into rectangles on screen, and draws them.
//
// Recomputed lazily by update(), only when something it depends on changed. In between, fill_image() and the
// queries can be called any number of times, e.g. once per frame while the store keeps getting written to
// (new words show up in the image; new pages only after the next update()).
//
// Zoom > 0 shrinks the address space: each cell is 2^zoom units. Zoom < 0 magnifies: each cell is 2^-zoom pixels
// wide and tall. When drawing from a down-sampled store, pass the zoom relative to that store.
pub struct DisplayLayout {
    pub mode: LayoutMode,
    pub compact: bool,
    pub max_magnify_bits: u32,
    pub slow_log_secs: f64,

    pub validity: Validity,
    key: Option<LayoutKey>,

    blocks: Vec<DisplayBlock>,
    content: (i64, i64),

    shift: u32,
    magnify_bits: u32,
    order: CurveOrder,
    root_level: u32,
    row_width: u64,
}

impl DisplayLayout {
    pub fn new(settings: &Settings) -> Self {
        Self {mode: settings.layout_mode, compact: settings.compact, max_magnify_bits: settings.max_magnify_bits, slow_log_secs: settings.log_slow_ops_secs, validity: Validity::Stale, key: None, blocks: Vec::new(), content: (0, 0), shift: 0, magnify_bits: 0, order: CurveOrder::Block, root_level: 0, row_width: 1}
    }

    pub fn set_mode(&mut self, mode: LayoutMode) {
        if mode != self.mode {
            self.mode = mode;
            self.validity = Validity::Stale;
        }
    }

    pub fn set_compact(&mut self, compact: bool) {
        if compact != self.compact {
            self.compact = compact;
            self.validity = Validity::Stale;
        }
    }

    pub fn blocks(&self) -> &[DisplayBlock] { &self.blocks }
    // Size of the drawn area in pixels.
    pub fn content_size(&self) -> (i64, i64) { self.content }
    pub fn shift(&self) -> u32 { self.shift }
    pub fn magnify_bits(&self) -> u32 { self.magnify_bits }
    pub fn order(&self) -> CurveOrder { self.order }

    pub fn block_at(&self, col: i64, row: i64) -> Option<&DisplayBlock> {
        self.blocks.iter().find(|b| b.display.contains(col, row))
    }

    // Returns true if the layout was recomputed. `content_width` is the row width for Linear mode (0 = same as window).
    pub fn update(&mut self, store: &SparseAddressStore, window_width: usize, content_width: usize, zoom: i32) -> bool {
        let key = LayoutKey {config: store.config, page_count: store.page_count(), window_width, content_width, zoom, mode: self.mode, compact: self.compact};
        if self.validity == Validity::Valid && self.key == Some(key) {
            return false;
        }
        self.validity = Validity::Computing;
        let _prof = ProfileScope::with_threshold(self.slow_log_secs, format!("layout of {} pages", key.page_count));

        let c = &store.config;
        self.shift = if zoom > 0 {(zoom as u32).min(c.address_bits)} else {0};
        // Zooming in scales every cell to a 2^m x 2^m square instead of relaying blocks out in rows of the wider window:
        // the curve modes keep their shape at every zoom, so a region stays where it was on screen while zooming.
        self.magnify_bits = if zoom < 0 {zoom.unsigned_abs().min(self.max_magnify_bits)} else {0};
        self.root_level = root_level(c.address_bits - self.shift);
        // With tiny tiles Hilbert order just looks noisy.
        self.order = if self.mode == LayoutMode::Hilbert && c.page_bits.saturating_sub(self.shift) > 4 {CurveOrder::Hilbert} else {CurveOrder::Block};
        let w = if content_width > 0 {content_width} else {window_width};
        self.row_width = ((w >> self.magnify_bits) as u64).max(1);

        let runs = self.extract_runs(store);
        self.blocks.clear();
        for (start, end) in runs {
            match self.mode {
                LayoutMode::Linear => {
                    let bbox = linear_box(self.row_width, start, end);
                    self.blocks.push(DisplayBlock {address: start, size: end - start, bbox, display: bbox});
                }
                _ if self.compact => {
                    for (addr, level) in quadtree_chunks(self.root_level, start, end) {
                        let n = enclosing_node(self.order, self.root_level, addr, addr + (1u64 << (2 * level)));
                        let bbox = Rect::new(n.x, n.y, n.x + n.side(), n.y + n.side());
                        self.blocks.push(DisplayBlock {address: addr, size: n.size(), bbox, display: bbox});
                    }
                }
                _ => {
                    let bbox = natural_box(self.order, self.root_level, start, end);
                    self.blocks.push(DisplayBlock {address: start, size: end - start, bbox, display: bbox});
                }
            }
        }

        compact_axis(&mut self.blocks, 1);
        if self.mode != LayoutMode::Linear {
            compact_axis(&mut self.blocks, 0);
        }
        let m = self.magnify_bits;
        self.content = (0, 0);
        for b in &mut self.blocks {
            b.display = Rect::new(b.display.x0 << m, b.display.y0 << m, b.display.x1 << m, b.display.y1 << m);
            self.content = (self.content.0.max(b.display.x1), self.content.1.max(b.display.y1));
        }

        self.key = Some(key);
        self.validity = Validity::Valid;
        true
    }

    // Occupied cell ranges, ascending and disjoint.
    fn extract_runs(&self, store: &SparseAddressStore) -> Vec<(u64, u64)> {
        let mut pages: Vec<(u64, u64)> = Vec::new();
        for p in store.display_iter() {
            match pages.last_mut() {
                Some(r) if !self.compact || p - r.1 <= (r.1 - r.0) / 8 => r.1 = p + 1,
                _ => pages.push((p, p + 1)),
            }
        }
        let (pb, shift) = (store.config.page_bits, self.shift);
        let mut runs: Vec<(u64, u64)> = Vec::with_capacity(pages.len());
        for (p0, p1) in pages {
            let start = (p0 << pb) >> shift;
            let end = ((p1 << pb) + (1u64 << shift) - 1) >> shift;
            match runs.last_mut() {
                Some(r) if start <= r.1 => r.1 = r.1.max(end),
                _ => runs.push((start, end)),
            }
        }
        runs
    }

    // Draws the part of the layout at pixels [col_offset, col_offset + width) x [row_offset, row_offset + height).
    // Pixels outside all blocks, and cells of absent pages, are left as they are.
    pub fn fill_image<S: Source>(&self, image: &mut Image<S::Value>, source: &S, col_offset: i64, row_offset: i64) {
        let window = Rect::new(col_offset, row_offset, col_offset + image.width as i64, row_offset + image.height as i64);
        let mut buf: Vec<S::Value> = Vec::new();
        for b in &self.blocks {
            if !b.display.intersects(&window) {
                continue;
            }
            if self.mode == LayoutMode::Linear {
                self.fill_linear_block(b, image, source, &window, &mut buf);
            } else {
                self.fill_curve_block(b, image, source, &window, &mut buf);
            }
        }
    }

    fn fill_curve_block<S: Source>(&self, b: &DisplayBlock, image: &mut Image<S::Value>, source: &S, window: &Rect, buf: &mut Vec<S::Value>) {
        let m = self.magnify_bits;
        let cell_px = 1i64 << m;
        let (dx, dy) = (b.display.x0 - (b.bbox.x0 << m), b.display.y0 - (b.bbox.y0 << m));
        let page_bits = source.page_bits();
        let order = self.order;
        let top = enclosing_node(order, self.root_level, b.address, b.end());
        traverse(order, top, &mut |n: &Node| {
            if n.end() <= b.address || n.addr >= b.end() {
                return Visit::Prune;
            }
            let r = Rect::new(dx + (n.x << m), dy + (n.y << m), dx + ((n.x + n.side()) << m), dy + ((n.y + n.side()) << m));
            if !r.intersects(window) {
                return Visit::Prune;
            }
            let within_page = n.size() <= 1u64 << page_bits;
            if within_page && !source.exists(n.addr >> page_bits) {
                return Visit::Prune;
            }
            if n.level == 0 {
                image.fill_rect(r.x0 - window.x0, r.y0 - window.y0, r.x1 - window.x0, r.y1 - window.y0, source.value(n.addr));
                return Visit::Prune;
            }
            if within_page && n.level <= MAX_LUT_LEVEL && n.addr >= b.address && n.end() <= b.end() && window.contains_rect(&r) {
                let len = n.size() as usize;
                if buf.len() < len {
                    buf.resize(len, S::Value::default());
                }
                source.gather(n.addr, &mut buf[..len]);
                let (ox, oy) = (r.x0 - window.x0, r.y0 - window.y0);
                for (i, &c) in lut(order, n.state, n.level).iter().enumerate() {
                    let (cx, cy) = unpack_cell(c);
                    let (px, py) = (ox + (cx << m), oy + (cy << m));
                    if m == 0 {
                        image.set(px as usize, py as usize, buf[i]);
                    } else {
                        image.fill_rect(px, py, px + cell_px, py + cell_px, buf[i]);
                    }
                }
                return Visit::Prune;
            }
            Visit::Descend
        });
    }

    fn fill_linear_block<S: Source>(&self, b: &DisplayBlock, image: &mut Image<S::Value>, source: &S, window: &Rect, buf: &mut Vec<S::Value>) {
        let (m, w) = (self.magnify_bits, self.row_width);
        let cell_px = 1i64 << m;
        let (dx, dy) = (b.display.x0 - (b.bbox.x0 << m), b.display.y0 - (b.bbox.y0 << m));
        let pb = source.page_bits();
        // Visible rows and columns, in cells. Arithmetic shift rounds down for negative values too.
        let row_lo = b.bbox.y0.max((window.y0 - dy) >> m);
        let row_hi = b.bbox.y1.min(((window.y1 - dy - 1) >> m) + 1);
        let col_lo = ((window.x0 - dx) >> m).max(0) as u64;
        let col_hi = (((window.x1 - dx - 1) >> m) + 1).max(0) as u64;
        for row in row_lo..row_hi {
            let row_start = row as u64 * w;
            let start = b.address.max(row_start + col_lo);
            let end = b.end().min(row_start + w).min(row_start + col_hi);
            let py = dy + (row << m) - window.y0;
            let mut cell = start;
            while cell < end {
                let piece_end = (((cell >> pb) + 1) << pb).min(end);
                if source.exists(cell >> pb) {
                    let len = (piece_end - cell) as usize;
                    if buf.len() < len {
                        buf.resize(len, S::Value::default());
                    }
                    source.gather(cell, &mut buf[..len]);
                    for i in 0..len {
                        let px = dx + (((cell + i as u64 - row_start) as i64) << m) - window.x0;
                        image.fill_rect(px, py, px + cell_px, py + cell_px, buf[i]);
                    }
                }
                cell = piece_end;
            }
        }
    }

    // Byte address of the first unit of the cell drawn at a pixel, if any.
    pub fn query_pixel_address(&self, store: &SparseAddressStore, col: i64, row: i64) -> Option<u64> {
        let mut img: Image<Option<u64>> = Image::new(1, 1);
        self.fill_image(&mut img, &AddressSource::new(store, self.shift), col, row);
        img.get(0, 0)
    }
}

fn linear_box(row_width: u64, start: u64, end: u64) -> Rect {
    let (y0, y1) = (start / row_width, (end - 1) / row_width + 1);
    if y1 - y0 == 1 {
        Rect::new((start % row_width) as i64, y0 as i64, ((end - 1) % row_width + 1) as i64, y1 as i64)
    } else {
        Rect::new(0, y0 as i64, row_width as i64, y1 as i64)
    }
}

// Splits [start, end) into aligned power-of-4 pieces, each exactly one quadtree node. Returns (address, level) pairs.
fn quadtree_chunks(root_level: u32, start: u64, end: u64) -> Vec<(u64, u32)> {
    let mut res = Vec::new();
    let mut a = start;
    while a < end {
        let mut level = if a == 0 {root_level} else {(a.trailing_zeros() / 2).min(root_level)};
        while a + (1u64 << (2 * level)) > end {
            level -= 1;
        }
        res.push((a, level));
        a += 1u64 << (2 * level);
    }
    res
}

// Bounding box of the cells of [start, end) on the curve.
fn natural_box(order: CurveOrder, root_level: u32, start: u64, end: u64) -> Rect {
    let top = enclosing_node(order, root_level, start, end);
    let mut res: Option<Rect> = None;
    traverse(order, top, &mut |n: &Node| {
        if n.end() <= start || n.addr >= end {
            return Visit::Prune;
        }
        if n.addr >= start && n.end() <= end {
            let r = Rect::new(n.x, n.y, n.x + n.side(), n.y + n.side());
            res = Some(match res { Some(x) => x.union(&r), None => r });
            return Visit::Prune;
        }
        Visit::Descend
    });
    res.unwrap_or_default()
}

// Removes every stretch of the axis not covered by any block (including the one before the first block), by moving
// blocks toward 0. Reads `bbox`, writes `display`. The mapping is monotonic, so blocks keep their relative order
// and blocks that didn't overlap still don't.
fn compact_axis(blocks: &mut [DisplayBlock], axis: usize) {
    let mut edges: Vec<(i64, bool)> = Vec::with_capacity(blocks.len() * 2);
    for b in blocks.iter() {
        edges.push((b.bbox.lo(axis), true));
        edges.push((b.bbox.hi(axis), false));
    }
    // Ends before starts at the same position, so touching blocks don't produce a zero-width gap.
    edges.sort_unstable();

    // (position, total removed before it), for each gap end.
    let mut cuts: Vec<(i64, i64)> = Vec::new();
    let (mut depth, mut covered_until, mut removed) = (0usize, 0i64, 0i64);
    for (pos, is_start) in edges {
        if is_start {
            if depth == 0 && pos > covered_until {
                removed += pos - covered_until;
                cuts.push((pos, removed));
            }
            depth += 1;
        } else {
            depth -= 1;
            if depth == 0 {
                covered_until = pos;
            }
        }
    }

    let map = |p: i64| -> i64 {
        let i = cuts.partition_point(|&(c, _)| c <= p);
        if i == 0 {p} else {p - cuts[i - 1].1}
    };
    for b in blocks.iter_mut() {
        b.display.set_axis(axis, map(b.bbox.lo(axis)), map(b.bbox.hi(axis)));
    }
}
