//! Statistics collection. Enabled with `--features stats`.
//!
//! Counters are thread local and merged into a global table when a thread
//! exits, so [`print_stats`] reflects threads that have finished.

use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    sync::Mutex,
};

#[derive(Copy, Clone, Debug)]
struct MinMaxTotal {
    min:   u64,
    max:   u64,
    total: u64,
}

#[doc(hidden)]
pub struct Size {
    min_max_total: Option<MinMaxTotal>,
    count:         u64,
}

impl Debug for Size {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Size")
            .field("count", &self.count)
            .field("min", &self.min_max_total.map(|x| x.min))
            .field("max", &self.min_max_total.map(|x| x.max))
            .field("total", &self.min_max_total.map(|x| x.total))
            .field(
                "avg",
                &self
                    .min_max_total
                    .map(|x| x.total as f64 / self.count as f64),
            )
            .finish()
    }
}

impl Size {
    const NEW: Size = Size {
        min_max_total: None,
        count:         0,
    };

    fn record(&mut self, size: u64) {
        self.count += 1;
        if let Some(ref mut min_max_total) = &mut self.min_max_total {
            min_max_total.min = min_max_total.min.min(size);
            min_max_total.max = min_max_total.max.max(size);
            min_max_total.total += size;
        } else {
            self.min_max_total = Some(MinMaxTotal {
                min:   size,
                max:   size,
                total: size,
            });
        }
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count;
        self.min_max_total = match (self.min_max_total, rhs.min_max_total) {
            (Some(a), Some(b)) => Some(MinMaxTotal {
                min:   a.min.min(b.min),
                max:   a.max.max(b.max),
                total: a.total + b.total,
            }),
            (a, b) => a.or(b),
        };
    }
}

macro_rules! stats {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        /// Merged counters; the `Debug` rendering is the report format.
        #[derive(Debug)]
        #[doc(hidden)]
        pub struct Stats {
            $($name: Size),*
        }

        impl Stats {
            const NEW: Stats = Stats {
                $($name: Size::NEW),*
            };

            fn merge(&mut self, rhs: &Self) {
                $(self.$name.merge(&rhs.$name);)*
            }
        }

        $(
            $(#[$attr])*
            #[inline]
            pub(crate) fn $name(size: usize) {
                if cfg!(feature = "stats") {
                    THREAD.with(|stats| (stats.borrow_mut().0).$name.record(size as u64));
                }
            }
        )*
    };
}

stats! {
    /// Header CAS losses per successful admission.
    push_retries,
    /// Cell reloads while scanning predecessors, per admission.
    scan_spins,
    /// Raise attempts lost to a CAS race or a colliding flag bit, per fence.
    fence_retries,
    /// Cell reloads while draining predecessors, per fence.
    fence_spins,
}

struct ThreadStats(Stats);

impl Drop for ThreadStats {
    fn drop(&mut self) {
        if let Ok(mut global) = GLOBAL.lock() {
            global.merge(&self.0);
        }
    }
}

thread_local! {
    static THREAD: RefCell<ThreadStats> = const { RefCell::new(ThreadStats(Stats::NEW)) };
}

static GLOBAL: Mutex<Stats> = Mutex::new(Stats::NEW);

/// Dumps the counters merged from every exited thread to stdout.
pub fn print_stats() {
    if cfg!(feature = "stats") {
        match GLOBAL.lock() {
            Ok(stats) => println!("{:#?}", &*stats),
            Err(poisoned) => println!("{:#?}", &*poisoned.into_inner()),
        }
    } else {
        println!("`roundabout/stats` feature is not enabled")
    }
}
