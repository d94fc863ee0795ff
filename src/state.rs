use std::fmt;

// Packed per-address state. Bits, low to high:
//   [0, 3)    dtype
//   [3, 13)   thread (saturating)
//   13        selected
//   [14, 17)  type: bit 14 is the free flag, bits 15-16 are the AccessKind
//   [17, 32)  time
// Time is in the high bits so that comparing raw words compares recency first; for equal time, the type field
// decides, and AccessKind values are numbered so that read > write > instruction > alloc. Down-sampling relies on this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StateWord(pub u32);

pub const DTYPE_SHIFT: u32 = 0;
pub const DTYPE_MASK: u32 = 0x7;
pub const THREAD_SHIFT: u32 = 3;
pub const THREAD_MASK: u32 = 0x3ff << THREAD_SHIFT;
pub const MAX_THREAD: u32 = 0x3ff;
pub const SELECTED_BIT: u32 = 1 << 13;
pub const TYPE_SHIFT: u32 = 14;
pub const FREE_BIT: u32 = 1 << TYPE_SHIFT;
pub const KIND_SHIFT: u32 = 15;
pub const KIND_MASK: u32 = 0x3 << KIND_SHIFT;
pub const TIME_SHIFT: u32 = 17;
pub const TIME_BITS: u32 = 32 - TIME_SHIFT;
pub const EVENT_MASK: u32 = (1 << TIME_SHIFT) - 1;

// Clock values. 0 and 1 are reserved, live times cycle through [TIME_BASE, FULL_LIFE).
pub const TIME_UNTOUCHED: u32 = 0;
pub const TIME_STALE: u32 = 1;
pub const TIME_BASE: u32 = 2;
pub const FULL_LIFE: u32 = 1 << TIME_BITS;
pub const HALF_LIFE: u32 = FULL_LIFE / 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum AccessKind {
    Alloc = 0,
    Instruction = 1,
    Write = 2,
    Read = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum DataType {
    None = 0,
    Int32 = 1,
    Int64 = 2,
    Float32 = 3,
    Float64 = 4,
    Char = 5,
    Vector = 6,
}

impl AccessKind {
    pub fn from_bits(b: u32) -> Self {
        match b & 3 {
            0 => Self::Alloc,
            1 => Self::Instruction,
            2 => Self::Write,
            _ => Self::Read,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Instruction => "instruction",
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

impl DataType {
    pub fn from_bits(b: u32) -> Self {
        match b & DTYPE_MASK {
            1 => Self::Int32,
            2 => Self::Int64,
            3 => Self::Float32,
            4 => Self::Float64,
            5 => Self::Char,
            6 => Self::Vector,
            _ => Self::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Char => "char",
            Self::Vector => "vector",
        }
    }
}

// Event bits for SparseAddressStore::update_address(): a state word without the time.
pub fn event_bits(kind: AccessKind, thread: u32, dtype: DataType) -> u32 {
    ((kind as u32) << KIND_SHIFT) | (thread.min(MAX_THREAD) << THREAD_SHIFT) | ((dtype as u32) << DTYPE_SHIFT)
}

// Event bits for a deallocation. Only the free flag is applied; everything else about the word is kept.
pub fn free_event_bits() -> u32 {
    FREE_BIT
}

impl StateWord {
    pub fn new(time: u32, event: u32) -> Self {
        debug_assert!(time < FULL_LIFE);
        StateWord((time << TIME_SHIFT) | (event & EVENT_MASK))
    }

    pub fn time(self) -> u32 { self.0 >> TIME_SHIFT }
    pub fn kind(self) -> AccessKind { AccessKind::from_bits((self.0 & KIND_MASK) >> KIND_SHIFT) }
    pub fn is_free(self) -> bool { self.0 & FREE_BIT != 0 }
    pub fn thread(self) -> u32 { (self.0 & THREAD_MASK) >> THREAD_SHIFT }
    pub fn dtype(self) -> DataType { DataType::from_bits(self.0 >> DTYPE_SHIFT) }
    pub fn is_selected(self) -> bool { self.0 & SELECTED_BIT != 0 }
    pub fn is_touched(self) -> bool { self.time() != TIME_UNTOUCHED }
    pub fn is_stale(self) -> bool { self.time() == TIME_STALE }

    pub fn with_time(self, time: u32) -> Self {
        StateWord::new(time, self.0)
    }

    // How many ticks ago this word was written, or None for untouched and stale words.
    pub fn age(self, clock: u32) -> Option<u32> {
        time_age(self.time(), clock)
    }
}

pub fn time_age(time: u32, clock: u32) -> Option<u32> {
    if time < TIME_BASE {
        return None;
    }
    if time <= clock {
        Some(clock - time)
    } else {
        // Written in the previous cycle.
        Some(clock - TIME_BASE + FULL_LIFE - time)
    }
}

// Which times become ambiguous when the clock reaches `clock`; increment_time() turns them into TIME_STALE.
//  * Reaching HALF_LIFE: times in the upper half are from the previous cycle, and more than half a cycle old now.
//  * Reaching FULL_LIFE (just before the clock wraps to TIME_BASE): times in the lower half are more than half a cycle old.
// After this, every live time is within half a cycle of the clock, so age() is unambiguous.
pub fn stale_predicate(clock: u32) -> Option<fn(u32) -> bool> {
    if clock == HALF_LIFE {
        Some(|t| t >= HALF_LIFE)
    } else if clock == FULL_LIFE {
        Some(|t| t >= TIME_BASE && t < HALF_LIFE)
    } else {
        None
    }
}

impl fmt::Debug for StateWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StateWord {{time: {}, kind: {:?}, free: {}, thread: {}, dtype: {:?}, selected: {}}}", self.time(), self.kind(), self.is_free(), self.thread(), self.dtype(), self.is_selected())
    }
}
