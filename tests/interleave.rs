mod interleave {
    use crossbeam_utils::thread;
    use roundabout::Roundabout;
    use std::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
        sync::Mutex,
        time::Duration,
    };

    // if a regression serializes what must overlap (or wedges a scan),
    // abort and fail the test instead of hanging the suite
    fn watchdog() {
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(60));
            std::process::abort();
        });
    }

    #[test]
    fn same_lane_locks_are_disjoint_and_fifo() {
        const THREADS: usize = 3;
        const ITERS: usize = 200;

        let log = Roundabout::new();
        let inside = AtomicUsize::new(0);
        let executed = Mutex::new(Vec::new());

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|_| {
                    for _ in 0..ITERS {
                        log.lock_lane(1, |epoch, _| {
                            let live = inside.fetch_add(1, SeqCst);
                            assert_eq!(live, 0, "two same-lane exclusives overlapped");
                            executed.lock().unwrap().push(epoch);
                            inside.fetch_sub(1, SeqCst);
                        });
                    }
                });
            }
        })
        .unwrap();

        let executed = executed.into_inner().unwrap();
        assert_eq!(executed.len(), THREADS * ITERS);
        // conflicting operations must run in admission order
        for pair in executed.windows(2) {
            assert!(pair[0] < pair[1], "execution order broke admission order");
        }
    }

    #[test]
    fn different_lanes_overlap() {
        watchdog();
        let log = Roundabout::new();
        let a_in = AtomicBool::new(false);
        let b_in = AtomicBool::new(false);

        // each side waits inside its callback for the other to arrive;
        // completion is the proof of overlap
        thread::scope(|s| {
            s.spawn(|_| {
                log.lock_lane(1, |_, _| {
                    a_in.store(true, SeqCst);
                    while !b_in.load(SeqCst) {
                        std::thread::yield_now();
                    }
                })
            });
            s.spawn(|_| {
                log.lock_lane(2, |_, _| {
                    b_in.store(true, SeqCst);
                    while !a_in.load(SeqCst) {
                        std::thread::yield_now();
                    }
                })
            });
        })
        .unwrap();
    }

    #[test]
    fn a_full_ring_of_shares_is_live_at_once() {
        watchdog();
        let log = Roundabout::new();
        let present = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..Roundabout::<roundabout::LaneEq>::CAPACITY {
                s.spawn(|_| {
                    log.share_lane(1, |_, _| {
                        present.fetch_add(1, SeqCst);
                        while present.load(SeqCst) < Roundabout::<roundabout::LaneEq>::CAPACITY {
                            std::thread::yield_now();
                        }
                    })
                });
            }
        })
        .unwrap();

        assert_eq!(log.epoch(), Roundabout::<roundabout::LaneEq>::CAPACITY as u16);
    }

    #[test]
    fn orders_pass_live_shares() {
        watchdog();
        let log = Roundabout::new();
        let share_in = AtomicBool::new(false);
        let order_done = AtomicBool::new(false);
        let release = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|_| {
                log.share_ring(|_, _| {
                    share_in.store(true, SeqCst);
                    while !release.load(SeqCst) {
                        std::thread::yield_now();
                    }
                })
            });
            s.spawn(|_| {
                while !share_in.load(SeqCst) {
                    std::thread::yield_now();
                }
                // must complete while the share is still parked in its callback
                log.order_ring(|_, _| {});
                order_done.store(true, SeqCst);
                release.store(true, SeqCst);
            });
        })
        .unwrap();

        assert!(order_done.load(SeqCst));
    }

    #[test]
    fn lock_ring_waits_for_a_live_share() {
        watchdog();
        let log = Roundabout::new();
        let share_in = AtomicBool::new(false);
        let release = AtomicBool::new(false);
        let lock_ran = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|_| {
                log.share_ring(|_, _| {
                    share_in.store(true, SeqCst);
                    while !release.load(SeqCst) {
                        std::thread::yield_now();
                    }
                })
            });
            s.spawn(|_| {
                while !share_in.load(SeqCst) {
                    std::thread::yield_now();
                }
                log.lock_ring(|_, _| {
                    // we only get here after the share retracted, which
                    // happens after the release flag went up
                    assert!(release.load(SeqCst), "exclusive ran under a live share");
                    lock_ran.store(true, SeqCst);
                });
            });
            while !share_in.load(SeqCst) {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(50));
            assert!(!lock_ran.load(SeqCst), "exclusive did not wait for the share");
            release.store(true, SeqCst);
        })
        .unwrap();

        assert!(lock_ran.load(SeqCst));
    }

    #[test]
    fn exclusive_counter_stress() {
        const THREADS: usize = 8;
        const ITERS: usize = 1_000;

        struct Racy(UnsafeCell<u64>);
        // all access happens under LockRing
        unsafe impl Sync for Racy {}

        let log = Roundabout::new();
        let counter = Racy(UnsafeCell::new(0));

        thread::scope(|s| {
            for _ in 0..THREADS {
                let log = &log;
                let counter = &counter;
                s.spawn(move |_| {
                    for _ in 0..ITERS {
                        log.lock_ring(|_, _| unsafe {
                            *counter.0.get() += 1;
                        });
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(unsafe { *counter.0.get() }, (THREADS * ITERS) as u64);
        assert_eq!(log.epoch(), (THREADS * ITERS) as u16);
    }

    #[test]
    fn lane_counters_stay_exact_under_mixed_lanes() {
        const THREADS: usize = 8;
        const ITERS: usize = 500;
        const LANES: usize = 4;

        struct Racy([UnsafeCell<u64>; LANES]);
        // cell `i` is only touched under LockLane(i)
        unsafe impl Sync for Racy {}

        let log = Roundabout::new();
        let counters = Racy(std::array::from_fn(|_| UnsafeCell::new(0)));

        thread::scope(|s| {
            for t in 0..THREADS {
                let log = &log;
                let counters = &counters;
                s.spawn(move |_| {
                    for i in 0..ITERS {
                        let lane = ((t + i) % LANES) as u32;
                        log.lock_lane(lane, |_, _| unsafe {
                            *counters.0[lane as usize].get() += 1;
                        });
                    }
                });
            }
        })
        .unwrap();

        let total: u64 = counters.0.iter().map(|c| unsafe { *c.get() }).sum();
        assert_eq!(total, (THREADS * ITERS) as u64);
    }
}
