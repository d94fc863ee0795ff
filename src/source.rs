use crate::{*, store::*, state::*, interval_map::*};

// Where DisplayLayout::fill_image() gets pixel values from.
//
// Everything is in the layout's cell space: at zoom shift z, cell c stands for store units [c << z, (c + 1) << z).
// A page is 2^page_bits() cells; exists() lets the rasterizer skip absent pages without looking at their cells.
pub trait Source {
    type Value: Copy + Default;

    fn page_bits(&self) -> u32;
    fn exists(&self, page: u64) -> bool;
    fn value(&self, cell: u64) -> Self::Value;

    // Values of cells [cell, cell + out.len()).
    fn gather(&self, cell: u64, out: &mut [Self::Value]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.value(cell + i as u64);
        }
    }
}

// Row-major pixel buffer.
#[derive(Clone, Debug)]
pub struct Image<T> {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<T>,
}

impl<T: Copy + Default> Image<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {width, height, pixels: vec![T::default(); width * height]}
    }

    pub fn get(&self, x: usize, y: usize) -> T { self.pixels[y * self.width + x] }
    pub fn set(&mut self, x: usize, y: usize, v: T) { self.pixels[y * self.width + x] = v; }

    // Fills [x0, x1) x [y0, y1), clipped to the image.
    pub fn fill_rect(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, v: T) {
        let (x0, x1) = (x0.max(0) as usize, (x1.min(self.width as i64)).max(0) as usize);
        let (y0, y1) = (y0.max(0) as usize, (y1.min(self.height as i64)).max(0) as usize);
        for y in y0..y1 {
            if x0 < x1 {
                self.pixels[y * self.width + x0..y * self.width + x1].fill(v);
            }
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(T::default());
    }
}

// Maps cells at a zoom shift to the store's units and pages. Shared by the sources below.
#[derive(Clone, Copy)]
pub struct CellSpace<'a> {
    pub store: &'a SparseAddressStore,
    pub shift: u32,
}

impl<'a> CellSpace<'a> {
    pub fn new(store: &'a SparseAddressStore, shift: u32) -> Self {
        Self {store, shift}
    }

    pub fn page_bits(&self) -> u32 { self.store.config.page_bits.saturating_sub(self.shift) }

    pub fn exists(&self, page: u64) -> bool {
        let pb = self.store.config.page_bits;
        if self.shift <= pb {
            return self.store.page_exists(page);
        }
        // One cell spans many pages. Find the first occupied one at or after the cell's first page.
        let k = self.shift - pb;
        let mut it = self.store.display_iter();
        it.seek(page << k);
        it.next().map_or(false, |p| p < (page + 1) << k)
    }

    pub fn first_unit(&self, cell: u64) -> u64 { cell << self.shift }

    // Byte address of the start of the cell in the traced process.
    pub fn addr(&self, cell: u64) -> u64 { self.store.addr_of(cell << self.shift) }

    pub fn cell_of_addr(&self, addr: u64) -> u64 { self.store.unit_of(addr) >> self.shift }
}

// Raw state words, max-reduced over each cell when shift > 0.
pub struct StateSource<'a> {
    pub cells: CellSpace<'a>,
}

impl<'a> StateSource<'a> {
    pub fn new(store: &'a SparseAddressStore, shift: u32) -> Self { Self {cells: CellSpace::new(store, shift)} }
}

impl<'a> Source for StateSource<'a> {
    type Value = StateWord;

    fn page_bits(&self) -> u32 { self.cells.page_bits() }
    fn exists(&self, page: u64) -> bool { self.cells.exists(page) }

    fn value(&self, cell: u64) -> StateWord {
        if self.cells.shift == 0 {
            return self.cells.store.get(cell);
        }
        let u = self.cells.first_unit(cell);
        (u..u + (1 << self.cells.shift)).map(|u| self.cells.store.get(u)).max().unwrap_or_default()
    }

    fn gather(&self, cell: u64, out: &mut [StateWord]) {
        if self.cells.shift != 0 {
            for (i, o) in out.iter_mut().enumerate() {
                *o = self.value(cell + i as u64);
            }
            return;
        }
        let mut buf = [0u32; 256];
        let mut done = 0;
        while done < out.len() {
            let n = (out.len() - done).min(buf.len());
            self.cells.store.get_range(cell + done as u64, &mut buf[..n]);
            for i in 0..n {
                out[done + i] = StateWord(buf[i]);
            }
            done += n;
        }
    }
}

// Byte address of each cell that's in an existing page.
pub struct AddressSource<'a> {
    pub cells: CellSpace<'a>,
}

impl<'a> AddressSource<'a> {
    pub fn new(store: &'a SparseAddressStore, shift: u32) -> Self { Self {cells: CellSpace::new(store, shift)} }
}

impl<'a> Source for AddressSource<'a> {
    type Value = Option<u64>;

    fn page_bits(&self) -> u32 { self.cells.page_bits() }
    fn exists(&self, page: u64) -> bool { self.cells.exists(page) }

    fn value(&self, cell: u64) -> Option<u64> {
        if self.cells.exists(cell >> self.cells.page_bits()) {
            Some(self.cells.addr(cell))
        } else {
            None
        }
    }
}

// Values derived from an IntervalMap, e.g. the name of the mapping each cell belongs to, or its allocation stack trace.
// Holds the map's lock for the whole lifetime of the source, so create it right before filling an image and drop it right after.
pub struct IntervalSource<'a, V, T, F: Fn(&V) -> T> {
    pub cells: CellSpace<'a>,
    reader: IntervalReader<'a, V>,
    f: F,
}

impl<'a, V, T, F: Fn(&V) -> T> IntervalSource<'a, V, T, F> {
    pub fn new(store: &'a SparseAddressStore, shift: u32, map: &'a IntervalMap<V>, f: F) -> Self {
        Self {cells: CellSpace::new(store, shift), reader: map.reader(), f}
    }
}

impl<'a, V, T: Copy + Default, F: Fn(&V) -> T> Source for IntervalSource<'a, V, T, F> {
    type Value = T;

    fn page_bits(&self) -> u32 { self.cells.page_bits() }
    fn exists(&self, page: u64) -> bool { self.cells.exists(page) }

    fn value(&self, cell: u64) -> T {
        match self.reader.find(self.cells.addr(cell)) {
            Some(iv) => (self.f)(&iv.value),
            None => T::default(),
        }
    }

    // Walks intervals rather than looking up every cell.
    fn gather(&self, cell: u64, out: &mut [T]) {
        let mut i = 0usize;
        while i < out.len() {
            let addr = self.cells.addr(cell + i as u64);
            let iv = match self.reader.find_after(addr) {
                None => {
                    out[i..].fill(T::default());
                    return;
                }
                Some(iv) => iv,
            };
            let (v, until) = if iv.start <= addr {
                ((self.f)(&iv.value), iv.end)
            } else {
                (T::default(), iv.start)
            };
            // Cells whose start address is before `until` get `v`.
            let until_cell = self.cells.cell_of_addr(until - 1) + 1;
            let n = (until_cell.saturating_sub(cell + i as u64) as usize).clamp(1, out.len() - i);
            out[i..i + n].fill(v);
            i += n;
        }
    }
}
