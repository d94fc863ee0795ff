use crate::{*, error::*, layout::*, store::*};

pub struct Settings {
    // Unit address space is 2^address_bits units; a unit is 2^ignore_bits bytes of the traced process.
    pub address_bits: u32,
    pub ignore_bits: u32,
    pub page_bits: u32, // must be even: a page is drawn as a square tile (12 -> 64x64)
    pub top_bits: u32, // superregion size for skip-scanning

    pub worker_threads: usize,
    pub downsample_batch_pages: usize,

    pub layout_mode: LayoutMode,
    pub compact: bool,
    pub max_magnify_bits: u32, // how far negative zoom may go

    pub log_slow_ops_secs: f64, // ProfileScope threshold for layout and down-sampling
}

impl Default for Settings {
    fn default() -> Self { Settings {
        address_bits: 36,
        ignore_bits: 0,
        page_bits: 12,
        top_bits: 24,

        worker_threads: 4,
        downsample_batch_pages: 16,

        layout_mode: LayoutMode::Hilbert,
        compact: true,
        max_magnify_bits: 8,

        log_slow_ops_secs: 0.05,
    } }
}

impl Settings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {address_bits: self.address_bits, ignore_bits: self.ignore_bits, page_bits: self.page_bits, top_bits: self.top_bits}
    }

    pub fn validate(&self) -> Result<()> {
        self.store_config().validate()?;
        if self.worker_threads == 0 || self.worker_threads > 1024 {
            return err!(Usage, "worker_threads must be in 1..=1024, got {}", self.worker_threads);
        }
        if self.downsample_batch_pages == 0 {
            return err!(Usage, "downsample_batch_pages must be positive");
        }
        if self.max_magnify_bits > 8 {
            return err!(Usage, "max_magnify_bits must be at most 8, got {}", self.max_magnify_bits);
        }
        Ok(())
    }

    // Overrides from environment variables, for quick experiments without a config file.
    pub fn apply_env(&mut self) -> Result<()> {
        fn var(name: &str) -> Result<Option<String>> {
            match std::env::var(name) {
                Ok(s) => Ok(Some(s)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(e) => Err(error!(Environment, "{}: {}", name, e)),
            }
        }
        if let Some(s) = var("MEMVIZ_ADDRESS_BITS")? { self.address_bits = s.trim().parse()?; }
        if let Some(s) = var("MEMVIZ_IGNORE_BITS")? { self.ignore_bits = s.trim().parse()?; }
        if let Some(s) = var("MEMVIZ_PAGE_BITS")? { self.page_bits = s.trim().parse()?; }
        if let Some(s) = var("MEMVIZ_THREADS")? { self.worker_threads = s.trim().parse()?; }
        self.validate()
    }
}
