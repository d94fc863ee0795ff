use std::{collections::VecDeque, time::Instant};

// Short status lines for whoever displays the tracker state (zoom switches, dropped events, etc).
// Developer-facing diagnostics go to stderr instead, prefixed with "info:", "warning:" or "fatal:".
pub struct Log {
    pub lines: VecDeque<String>,
}

const MAX_LINES: usize = 100;

impl Log {
    pub fn new() -> Log { Log {lines: VecDeque::with_capacity(MAX_LINES)} }

    pub fn add_line(&mut self, line: String) {
        if self.lines.len() == MAX_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn last(&self) -> Option<&str> { self.lines.back().map(String::as_str) }
    pub fn clear(&mut self) { self.lines.clear(); }
}

// log!(tracker.log, "zoom {}: ...", shift)
#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// Times a scope and reports it on stderr when dropped, if it took at least `threshold_secs`.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
    active: bool,
}

impl ProfileScope {
    pub fn new(name: String) -> Self { Self::with_threshold(0.0, name) }

    pub fn with_threshold(threshold_secs: f64, name: String) -> Self {
        ProfileScope {name, start: Instant::now(), threshold_secs, active: true}
    }

    pub fn elapsed_secs(&self) -> f64 { self.start.elapsed().as_secs_f64() }

    pub fn cancel(&mut self) { self.active = false; }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let secs = self.elapsed_secs();
        if self.active && secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}s", self.name, secs);
        }
    }
}
