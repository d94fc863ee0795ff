use std::{fmt, mem::ManuallyDrop, collections::HashMap};

// Caps how many times each call site may print a warning. Call sites are identified by line!().
//   if self.limiter.check_n(line!(), 10) { eprintln!("warning: ..."); }
pub struct Limiter {
    printed: HashMap<u32, u16>,
}

impl Limiter {
    pub fn new() -> Self { Self {printed: HashMap::new()} }

    pub fn check(&mut self, line: u32) -> bool { self.check_n(line, 1) }

    pub fn check_n(&mut self, line: u32, n: u16) -> bool {
        let c = self.printed.entry(line).or_insert(0);
        if *c >= n {
            return false;
        }
        *c += 1;
        true
    }
}

// Runs a closure when dropped, see defer!.
pub struct ScopeGuard<F: FnOnce()> { f: ManuallyDrop<F> }
impl<F: FnOnce()> ScopeGuard<F> { pub fn new(f: F) -> Self { Self {f: ManuallyDrop::new(f)} } }
impl<F: FnOnce()> Drop for ScopeGuard<F> { fn drop(&mut self) { (unsafe {ManuallyDrop::take(&mut self.f)})(); } }
#[macro_export]
macro_rules! defer { ($($t:tt)*) => { let _guard = $crate::util::ScopeGuard::new(|| { $($t)* }); }; }

fn write_scaled(f: &mut fmt::Formatter<'_>, x: usize, base: f64, suffixes: &[&str]) -> fmt::Result {
    let mut v = x as f64;
    let mut i = 0;
    while v >= base && i + 1 < suffixes.len() {
        v /= base;
        i += 1;
    }
    if i == 0 {
        write!(f, "{}{}", x, suffixes[0])
    } else {
        write!(f, "{:.3}{}", v, suffixes[i])
    }
}

// Event and page counts: "42", "12.400 K", "1.500 M".
pub struct PrettyCount(pub usize);
impl fmt::Display for PrettyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.0, 1000.0, &["", " K", " M", " G", " T", " P", " E"])
    }
}

// Memory sizes in binary units: "1000 B", "3.000 MiB".
pub struct PrettySize(pub usize);
impl fmt::Display for PrettySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.0, 1024.0, &[" B", " KiB", " MiB", " GiB", " TiB", " PiB", " EiB"])
    }
}
