use std::sync::OnceLock;

// Quadtree over a square of 4^level cells. Node at `level` covers 4^level consecutive addresses starting at `addr`,
// drawn as a 2^level x 2^level square with top-left cell (x, y). Children split the address range into quarters;
// the order decides where each quarter goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurveOrder {
    // Quarters in row-major order: top-left, top-right, bottom-left, bottom-right (Morton / Z-order).
    Block,
    // Quarters in Hilbert order, so that consecutive addresses are always in adjacent cells.
    Hilbert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub level: u32,
    pub x: i64,
    pub y: i64,
    pub addr: u64,
    // Hilbert orientation, see transform(). Always 0 for Block order.
    pub state: u8,
}

impl Node {
    pub fn root(level: u32) -> Self { Node {level, x: 0, y: 0, addr: 0, state: 0} }
    pub fn side(&self) -> i64 { 1 << self.level }
    pub fn size(&self) -> u64 { 1 << (2 * self.level) }
    pub fn end(&self) -> u64 { self.addr + self.size() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    Prune,
    Descend,
}

// Hilbert orientation states form the Klein four-group under composition, so composing is xor:
//   0: identity, 1: transpose (x,y)->(y,x), 2: anti-transpose (x,y)->(1-y,1-x), 3: rotation by 180 degrees (x,y)->(1-x,1-y).
// In the canonical orientation the quarters go (0,0), (0,1), (1,1), (1,0); the first quarter is transposed, the last one anti-transposed.
const HILBERT_CELLS: [(i64, i64); 4] = [(0, 0), (0, 1), (1, 1), (1, 0)];
const HILBERT_CHILD_STATE: [u8; 4] = [1, 0, 0, 2];

fn transform(state: u8, (x, y): (i64, i64)) -> (i64, i64) {
    match state & 3 {
        0 => (x, y),
        1 => (y, x),
        2 => (1 - y, 1 - x),
        _ => (1 - x, 1 - y),
    }
}

pub fn child(order: CurveOrder, node: &Node, q: u32) -> Node {
    debug_assert!(node.level > 0 && q < 4);
    let level = node.level - 1;
    let half = 1i64 << level;
    let addr = node.addr + ((q as u64) << (2 * level));
    let ((cx, cy), state) = match order {
        CurveOrder::Block => (((q & 1) as i64, (q >> 1) as i64), 0),
        CurveOrder::Hilbert => (transform(node.state, HILBERT_CELLS[q as usize]), node.state ^ HILBERT_CHILD_STATE[q as usize]),
    };
    Node {level, x: node.x + cx * half, y: node.y + cy * half, addr, state}
}

// Depth-first in address order. `visit` decides whether to go into each node's children; leaves (level 0) are visited too.
pub fn traverse<F: FnMut(&Node) -> Visit>(order: CurveOrder, root: Node, visit: &mut F) {
    if visit(&root) == Visit::Prune || root.level == 0 {
        return;
    }
    for q in 0..4 {
        traverse(order, child(order, &root, q), visit);
    }
}

// Root level of a square big enough for 2^address_bits cells.
pub fn root_level(address_bits: u32) -> u32 {
    (address_bits + 1) / 2
}

// Smallest node containing [start, end), within a root of `level`. Used to avoid walking down from the root for every block.
pub fn enclosing_node(order: CurveOrder, level: u32, start: u64, end: u64) -> Node {
    debug_assert!(start < end && end <= 1u64 << (2 * level));
    let mut node = Node::root(level);
    while node.level > 0 {
        let l = node.level - 1;
        let q = ((start - node.addr) >> (2 * l)) as u32;
        if ((end - 1 - node.addr) >> (2 * l)) as u32 != q {
            break;
        }
        node = child(order, &node, q);
    }
    node
}

// Cell coordinates of every address in a node, for nodes of up to MAX_LUT_LEVEL, packed as x | y << 8.
pub const MAX_LUT_LEVEL: u32 = 6;

struct Luts {
    block: Vec<Vec<u16>>,
    hilbert: [Vec<Vec<u16>>; 4],
}

static LUTS: OnceLock<Luts> = OnceLock::new();

fn build_lut(order: CurveOrder, state: u8, level: u32) -> Vec<u16> {
    let mut res = Vec::with_capacity(1 << (2 * level));
    let root = Node {level, x: 0, y: 0, addr: 0, state};
    traverse(order, root, &mut |n: &Node| {
        if n.level == 0 {
            res.push((n.x | (n.y << 8)) as u16);
        }
        Visit::Descend
    });
    res
}

fn luts() -> &'static Luts {
    LUTS.get_or_init(|| {
        let levels = |order, state| (0..=MAX_LUT_LEVEL).map(|l| build_lut(order, state, l)).collect::<Vec<_>>();
        Luts {block: levels(CurveOrder::Block, 0), hilbert: [0, 1, 2, 3].map(|s| levels(CurveOrder::Hilbert, s))}
    })
}

// Offsets relative to the node's top-left cell, in address order.
pub fn lut(order: CurveOrder, state: u8, level: u32) -> &'static [u16] {
    assert!(level <= MAX_LUT_LEVEL);
    let l = luts();
    match order {
        CurveOrder::Block => &l.block[level as usize],
        CurveOrder::Hilbert => &l.hilbert[(state & 3) as usize][level as usize],
    }
}

pub fn unpack_cell(c: u16) -> (i64, i64) {
    ((c & 0xff) as i64, (c >> 8) as i64)
}
