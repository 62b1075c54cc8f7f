mod fence {
    use crossbeam_utils::thread;
    use roundabout::{Claim, Roundabout};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
        sync::Mutex,
        time::Duration,
    };

    fn watchdog() {
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(60));
            std::process::abort();
        });
    }

    #[test]
    fn a_fence_drains_earlier_writers() {
        const WRITERS: usize = 10;

        watchdog();
        let log = Roundabout::new();
        let epochs = Mutex::new(Vec::new());
        let started = AtomicUsize::new(0);

        thread::scope(|s| {
            let log = &log;
            let epochs = &epochs;
            let started = &started;
            for i in 0..WRITERS {
                s.spawn(move |_| {
                    log.lock_lane(i as u32, |epoch, _| {
                        epochs.lock().unwrap().push(epoch);
                        started.fetch_add(1, SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                    });
                });
            }
            while started.load(SeqCst) < WRITERS {
                std::thread::yield_now();
            }
            log.fence(0b1, |fence_epoch, _| {
                // every earlier writer has retracted by the time we run
                for &epoch in epochs.lock().unwrap().iter() {
                    assert!(!log.is_active(epoch), "epoch {} alive inside fence", epoch);
                    assert!(
                        fence_epoch.wrapping_sub(epoch) >= 1,
                        "fence admitted behind a drained writer"
                    );
                }
            });
        })
        .unwrap();
    }

    #[test]
    fn fences_do_not_wait_for_shares() {
        // a live share on the same thread: the drain must pass it, and the
        // fence still sees it active afterwards
        let log = Roundabout::new();
        let share = log.acquire(Claim::ShareLane(1));
        let fence = log.raise_fence(0b1);
        assert!(log.is_active(share.epoch()));
        assert_eq!(log.flags(), 0b1);
        drop(fence);
        drop(share);
        assert_eq!(log.flags(), 0);
    }

    #[test]
    fn colliding_fence_bits_wait_for_release() {
        watchdog();
        let log = Roundabout::new();
        let second_done = AtomicBool::new(false);

        let first = log.raise_fence(0b1);
        thread::scope(|s| {
            s.spawn(|_| {
                // spins until the first fence clears the shared bit
                log.fence(0b1, |_, flags| assert_eq!(flags, 0b1));
                second_done.store(true, SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!second_done.load(SeqCst), "colliding fence bits overlapped");
            drop(first);
        })
        .unwrap();

        assert!(second_done.load(SeqCst));
        assert_eq!(log.flags(), 0);
    }

    #[test]
    fn phase_spans_cover_concurrent_admissions() {
        const ADMISSIONS: usize = 5;

        watchdog();
        let log = Roundabout::new();
        let span = log.phase::<_, ()>(
            0b10,
            |_, _| {
                thread::scope(|s| {
                    let log = &log;
                    for i in 0..ADMISSIONS {
                        s.spawn(move |_| {
                            log.lock_lane(i as u32, |_, flags| {
                                assert_eq!(flags, 0b10, "admission missed the raised flags");
                            })
                        });
                    }
                })
                .unwrap();
                Ok(())
            },
            |start, end| Ok(end.wrapping_sub(start)),
        );
        assert_eq!(span, Ok(ADMISSIONS as u16));
    }

    #[test]
    fn late_writers_start_under_a_live_fence() {
        // a fence blocks nothing admitted after it; the flags are advisory
        watchdog();
        let log = Roundabout::new();
        let writer_done = AtomicBool::new(false);

        let fence = log.raise_fence(0b100);
        thread::scope(|s| {
            s.spawn(|_| {
                log.lock_lane(1, |_, flags| {
                    assert_eq!(flags, 0b100);
                });
                writer_done.store(true, SeqCst);
            });
            while !writer_done.load(SeqCst) {
                std::thread::yield_now();
            }
            // the writer finished with the fence still up
            assert_eq!(log.flags(), 0b100);
        })
        .unwrap();
        let end = fence.complete();
        assert_eq!(end, 1);
    }
}
