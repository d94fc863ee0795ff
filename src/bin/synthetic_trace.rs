#![allow(unused_imports)]
extern crate memviz;
use memviz::{*, error::*, log::*, settings::*, state::*, tracker::*, layout::*, source::*, util::*};
use std::{fs::File, io::{self, Write, BufWriter}};
use rand::{Rng, SeedableRng, rngs::StdRng};

// Generates a made-up trace (a few mappings, a heap with mallocs and frees, a stack, some code being executed),
// feeds it through the tracker, and writes the final picture as a PPM file.

fn color(w: StateWord, clock: u32) -> [u8; 3] {
    if !w.is_touched() {
        return [24, 24, 24];
    }
    if w.is_free() {
        return [70, 70, 70];
    }
    let base: [u8; 3] = match w.kind() {
        AccessKind::Alloc => [60, 90, 200],
        AccessKind::Instruction => [200, 60, 200],
        AccessKind::Write => [220, 60, 40],
        AccessKind::Read => [60, 200, 80],
    };
    // Fade with age, down to 1/4 brightness at half a clock cycle.
    let age = w.age(clock).unwrap_or(HALF_LIFE).min(HALF_LIFE);
    let k = 1.0 - 0.75 * (age as f64 / HALF_LIFE as f64).sqrt();
    base.map(|c| (c as f64 * k) as u8)
}

fn write_ppm(path: &str, img: &Image<[u8; 3]>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "P6\n{} {}\n255\n", img.width, img.height)?;
    for p in &img.pixels {
        out.write_all(p)?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 3 {
        eprintln!("Usage: {} [output.ppm] [num_events]", args[0]);
        std::process::exit(1);
    }
    let path = args.get(1).cloned().unwrap_or("memviz.ppm".to_string());
    let num_events: usize = match args.get(2) { Some(s) => s.parse().map_err(|e| error!(Usage, "bad num_events: {}", e))?, None => 2_000_000 };

    let mut settings = Settings::default();
    settings.address_bits = 32;
    settings.top_bits = 20;
    settings.apply_env()?;
    let (mut tracker, view) = match Tracker::new(&settings) {
        Err(e) if e.is_out_of_memory() => {
            eprintln!("fatal: {} (try a smaller MEMVIZ_ADDRESS_BITS)", e);
            std::process::exit(1);
        }
        r => r?,
    };

    let code = (0x400000u64, 0x480000u64);
    let heap = (0x1000000u64, 0x5000000u64);
    let stack = (0xfff00000u64, 0xfff80000u64);
    tracker.load_maps(&format!("{:x}-{:x} r-xp 00000000 08:01 42 /usr/bin/synthetic\n{:x}-{:x} rw-p 00000000 00:00 0 [heap]\n{:x}-{:x} rw-p 00000000 00:00 0 [stack]\n", code.0, code.1, heap.0, heap.1, stack.0, stack.1))?;

    let mut rng = StdRng::seed_from_u64(1);
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut heap_top = heap.0;
    let mut next_trace = 1u64;
    {
        let _prof = ProfileScope::new(format!("{} events", PrettyCount(num_events)));
        for i in 0..num_events {
            let thread = rng.gen_range(0..4u32);
            match rng.gen_range(0..100) {
                0..=1 if heap_top < heap.1 - (1 << 16) => {
                    let size = 1u64 << rng.gen_range(4..14);
                    let addr = heap_top;
                    heap_top += size;
                    tracker.update_address(addr, size, event_bits(AccessKind::Alloc, thread, DataType::None));
                    tracker.insert_stack_trace(addr, addr + size, next_trace);
                    next_trace += 1;
                    live.push((addr, size));
                }
                2 if !live.is_empty() => {
                    let (addr, size) = live.swap_remove(rng.gen_range(0..live.len()));
                    tracker.update_address(addr, size, free_event_bits());
                }
                3..=29 => {
                    let pc = rng.gen_range(code.0..code.1) & !3;
                    tracker.update_address(pc, 4, event_bits(AccessKind::Instruction, thread, DataType::None));
                }
                30..=59 if !live.is_empty() => {
                    let (addr, size) = live[rng.gen_range(0..live.len())];
                    let off = rng.gen_range(0..size) & !7;
                    let kind = if rng.gen_bool(0.3) {AccessKind::Write} else {AccessKind::Read};
                    tracker.update_address(addr + off, 8, event_bits(kind, thread, DataType::Int64));
                }
                _ => {
                    let sp = stack.1 - rng.gen_range(0..0x4000u64) * 8;
                    let kind = if rng.gen_bool(0.5) {AccessKind::Write} else {AccessKind::Read};
                    tracker.update_address(sp, 8, event_bits(kind, thread, DataType::Int64));
                }
            }
            if i % 1000 == 999 {
                tracker.increment_time();
                tracker.poll();
            }
        }
    }

    // Draw from a store down-sampled by 4, the way a viewer would after zooming out.
    view.request_zoom(2);
    tracker.poll();
    for line in &tracker.log.lines {
        eprintln!("info: {}", line);
    }

    let (shift, store) = view.current();
    let mut layout = DisplayLayout::new(&settings);
    layout.update(&store, 1024, 0, 0);
    let (w, h) = layout.content_size();
    eprintln!("info: {} blocks, {}x{} pixels, {} pages, store uses {}", layout.blocks().len(), w, h, PrettyCount(store.page_count()), PrettySize(store.memory_usage()));
    let (w, h) = (w.min(4096) as usize, h.min(4096) as usize);

    let mut words: Image<StateWord> = Image::new(w, h);
    {
        let _prof = ProfileScope::new("rendering".to_string());
        layout.fill_image(&mut words, &StateSource::new(&store, layout.shift()), 0, 0);
    }
    let clock = store.clock();
    let rgb = Image {width: w, height: h, pixels: words.pixels.iter().map(|&x| color(x, clock)).collect()};
    write_ppm(&path, &rgb)?;

    if let Some(b) = layout.blocks().first() {
        if let Some(addr) = layout.query_pixel_address(&store, b.display.x0, b.display.y0) {
            eprintln!("info: top-left of the first block: {}", view.address_info(addr));
        }
    }
    eprintln!("info: wrote {} (zoom shift {})", path, shift);
    Ok(())
}
