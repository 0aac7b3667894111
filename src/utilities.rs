//! Timing records and the memory-budgeted batch planner.

use crate::error::{PolarError, Result};
use num_traits::ToPrimitive;
use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Wall-clock timing records with named items, in the style of the SCF
/// driver's instrumentation.
pub struct TimeRecords {
    order: Vec<String>,
    items: HashMap<String, TimeItem>,
}

struct TimeItem {
    desc: String,
    elapsed: Duration,
    started: Option<Instant>,
}

impl TimeRecords {
    pub fn new() -> TimeRecords {
        TimeRecords {
            order: vec![],
            items: HashMap::new(),
        }
    }

    pub fn new_item(&mut self, name: &str, desc: &str) {
        if !self.items.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.items.insert(
            name.to_string(),
            TimeItem {
                desc: desc.to_string(),
                elapsed: Duration::ZERO,
                started: None,
            },
        );
    }

    pub fn count_start(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            item.started = Some(Instant::now());
        }
    }

    pub fn count(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            if let Some(start) = item.started.take() {
                item.elapsed += start.elapsed();
            }
        }
    }

    pub fn report(&self, name: &str) {
        if let Some(item) = self.items.get(name) {
            println!(
                "Time spent in {:40} ({:}): {:12.4} s",
                name,
                item.desc,
                item.elapsed.as_secs_f64()
            );
        }
    }

    pub fn report_all(&self) {
        println!("==== Timing report ====");
        for name in &self.order {
            self.report(name);
        }
    }
}

impl Default for TimeRecords {
    fn default() -> Self {
        TimeRecords::new()
    }
}

/// Partition `[start, stop)` into contiguous chunks of length `nbatch`, the
/// last chunk truncated to `stop`.
///
/// `start == stop` yields no chunks; `nbatch == 0` is a usage error. The
/// chunk arithmetic saturates, so `usize::MAX` (the "unconstrained" result
/// of [`calc_batch_size`] for a free dimension) is a legal chunk length.
pub fn gen_batch(start: usize, stop: usize, nbatch: usize) -> Result<Vec<Range<usize>>> {
    if nbatch == 0 {
        return Err(PolarError::Usage(
            "gen_batch called with zero batch size".to_string(),
        ));
    }
    let mut batches = vec![];
    let mut p0 = start;
    while p0 < stop {
        let p1 = p0.saturating_add(nbatch).min(stop);
        batches.push(p0..p1);
        p0 = p1;
    }
    return Ok(batches);
}

/// Calculate batch size within possible memory.
///
/// ``flop`` in parameters is number of data, not refers to FLOPs. This
/// function requires generic `<T>`, which determines size of data.
///
/// # Parameters
///
/// - `unit_flop`: Number of data for unit operation. For example, for a
///   tensor with shape (110, 120, 130) batched over the 1st dimension, a
///   unit operation handles 120x130 = 15,600 data. A value of 0 means the
///   batched dimension is unconstrained and the full range is returned.
/// - `mem_avail`: Memory available in MB. By default, it will check
///   available memory in os system.
/// - `mem_factor`: factor for mem_avail, to avoid all memory consumed;
///   should be smaller than 1, recommended 0.8.
/// - `pre_flop`: Number of data preserved in memory. Unit in number.
///
/// The result never drops below 1: the budget is advisory, and processing
/// one unit at a time is always legal even when the baseline already
/// exceeds it.
pub fn calc_batch_size<T>(
    unit_flop: usize,
    mem_avail: Option<f64>,
    mem_factor: Option<f64>,
    pre_flop: Option<usize>,
) -> usize {
    let nbytes_dtype = std::mem::size_of::<T>();
    if unit_flop == 0 {
        return usize::MAX;
    }
    let unit_mb = (unit_flop * nbytes_dtype) as f64 / 1024.0 / 1024.0;
    let pre_mb = pre_flop.unwrap_or(0) as f64 * nbytes_dtype as f64 / 1024.0 / 1024.0;
    let mem_factor = mem_factor.unwrap_or(crate::constants::BATCH_MEM_FACTOR);
    let mem_avail_mb = mem_avail.unwrap_or_else(|| {
        let sys = sysinfo::System::new_all();
        (sys.total_memory() - sys.used_memory()) as f64 / 1024.0 / 1024.0
    }) * mem_factor;
    let max_mb = mem_avail_mb - pre_mb;

    if unit_mb > max_mb {
        println!("[Warn] Memory overflow when preparing batch number.");
        println!(
            "Current memory available {:10.3} MB, minimum required {:10.3} MB",
            max_mb, unit_mb
        );
    }
    let batch_size = (max_mb / unit_mb).max(1.0).to_usize().unwrap_or(1);
    return batch_size;
}

#[cfg(test)]
mod debug {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn test_batch_coverage() {
        for &(start, stop, nbatch) in &[
            (0usize, 4usize, 2usize),
            (0, 10, 3),
            (3, 17, 5),
            (0, 1, 7),
            (5, 23, 1),
            (0, 16, usize::MAX),
        ] {
            let batches = gen_batch(start, stop, nbatch).unwrap();
            // contiguous, no gaps, no overlaps
            assert_eq!(batches.first().unwrap().start, start);
            assert_eq!(batches.last().unwrap().end, stop);
            for (prev, next) in batches.iter().tuple_windows() {
                assert_eq!(prev.end, next.start);
                assert!(prev.end > prev.start);
            }
            for batch in &batches {
                assert!(batch.end - batch.start <= nbatch);
            }
        }
    }

    #[test]
    fn test_batch_degenerate() {
        assert!(gen_batch(4, 4, 2).unwrap().is_empty());
        assert!(gen_batch(0, 0, 1).unwrap().is_empty());
        assert!(gen_batch(0, 4, 0).is_err());
    }

    #[test]
    fn test_batch_size_monotonic() {
        let mem = Some(64.0);
        let mut last = usize::MAX;
        for unit in [1usize, 100, 10_000, 1_000_000, 100_000_000] {
            let size = calc_batch_size::<f64>(unit, mem, None, None);
            assert!(size >= 1);
            assert!(size <= last);
            last = size;
        }
        let mut last = 0;
        for mb in [0.001, 0.1, 1.0, 64.0, 4096.0] {
            let size = calc_batch_size::<f64>(10_000, Some(mb), None, None);
            assert!(size >= last);
            last = size;
        }
    }

    #[test]
    fn test_batch_size_floors_at_one() {
        // baseline already exceeds the budget: advisory, still proceeds
        let size = calc_batch_size::<f64>(1_000_000, Some(1.0), None, Some(10_000_000));
        assert_eq!(size, 1);
    }

    #[test]
    fn test_batch_size_unconstrained() {
        assert_eq!(calc_batch_size::<f64>(0, Some(1.0), None, None), usize::MAX);
        let batches = gen_batch(0, 7, calc_batch_size::<f64>(0, Some(1.0), None, None)).unwrap();
        assert_eq!(batches, vec![0..7]);
    }
}
