//! Iteration engine
//!
//! One iteration scans every source's deadline, blocks in the poll driver
//! with a composite timeout, then dispatches callbacks for each source that
//! reported readiness or whose deadline passed. Callbacks may mutate the
//! source list, so the dispatch loop restarts from the top after every
//! invocation; the per-source `triggered` marker keeps a restarted scan
//! from firing the same source twice in one iteration.

use std::rc::Rc;

use nix::poll::{PollFd, PollFlags};
use tracing::{error, info, trace};

use crate::session::source::SourceKey;
use crate::session::{clock, poll};
use crate::session::Session;
use crate::{Result, SessionError};

impl Session {
    /// Run the session: poll event sources and dispatch their callbacks
    /// until none are left. Returns the first iteration error, or success
    /// once the registry drains.
    pub fn run(&self) -> Result<()> {
        if self.devs.borrow().is_empty() {
            error!("a session cannot be run without devices");
            return Err(SessionError::NoDevices);
        }
        self.set_running(true);

        info!("running");

        while self.source_count() > 0 {
            if let Err(err) = self.iterate() {
                self.set_running(false);
                return Err(err);
            }
        }
        self.set_running(false);
        Ok(())
    }

    /// Poll the session's event sources once.
    fn iterate(&self) -> Result<()> {
        if self.sources.borrow().is_empty() {
            self.check_aborted();
            return Ok(());
        }

        let start_time = clock::monotonic_us();
        let mut min_due = i64::MAX;

        for source in self.sources.borrow_mut().iter_mut() {
            if source.due < min_due {
                min_due = source.due;
            }
            source.triggered = false;
        }

        // Fold in the external subsystem's deadline, if one is active.
        let mut ext_due = i64::MAX;
        let mut ext_key = None;
        if let Some(provider) = self.ctx.deadline_provider() {
            match provider.next_timeout_us() {
                Ok(Some(timeout_us)) => {
                    ext_due = start_time.saturating_add(timeout_us);
                    if ext_due < min_due {
                        min_due = ext_due;
                    }
                    ext_key = Some(provider.source_key());
                    trace!("poll: next external timeout {:.3} ms", timeout_us as f64 / 1000.0);
                }
                Ok(None) => {}
                Err(err) => {
                    error!("error getting external deadline: {}", err);
                    return Err(err);
                }
            }
        }

        let timeout_ms = poll::poll_timeout_ms(min_due, start_time);

        // The flat descriptor array is rebuilt from the per-source
        // descriptors on every pass, then readiness is written back.
        let ready = {
            let mut sources = self.sources.borrow_mut();
            let num_fds = sources.iter().map(|s| s.descs.len()).sum();
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(num_fds);
            for source in sources.iter() {
                for desc in &source.descs {
                    pollfds.push(PollFd::new(desc.fd, desc.events));
                }
            }

            trace!(
                "poll enter: {} sources, {} fds, {} ms timeout",
                sources.len(),
                pollfds.len(),
                timeout_ms
            );

            let ready = poll::wait(&mut pollfds, timeout_ms)?;

            let mut slot = 0;
            for source in sources.iter_mut() {
                for desc in source.descs.iter_mut() {
                    desc.revents = pollfds[slot].revents().unwrap_or_else(PollFlags::empty);
                    slot += 1;
                }
            }
            ready
        };
        let stop_time = clock::monotonic_us();

        trace!(
            "poll leave: {:.3} ms elapsed, {} events",
            (stop_time - start_time) as f64 / 1000.0,
            ready
        );

        let mut any_triggered = false;
        let mut stopped = false;
        let mut index = 0;

        loop {
            // Find the next source to dispatch under the registry borrow,
            // then release it before invoking the callback so the callback
            // may re-enter the session.
            let fire = {
                let mut sources = self.sources.borrow_mut();
                let mut fire = None;
                while index < sources.len() {
                    let source = &mut sources[index];

                    let mut fd = match source.key {
                        SourceKey::Fd(fd) => fd,
                        _ => -1,
                    };
                    let mut revents = PollFlags::empty();
                    for desc in &source.descs {
                        fd = desc.fd;
                        revents |= desc.revents;
                    }

                    if source.triggered {
                        index += 1;
                        continue; // already handled
                    }
                    if ready > 0 && revents.is_empty() {
                        index += 1;
                        continue; // skip timeouts if any I/O event occurred
                    }

                    // No single fd is meaningful for a descriptor set.
                    if source.descs.len() > 1 {
                        fd = -1;
                    }
                    if ready <= 0 {
                        revents = PollFlags::empty();
                    }

                    let mut due = source.due;
                    if ext_due < due && Some(source.key) == ext_key {
                        due = ext_due;
                    }
                    if revents.is_empty() && stop_time < due {
                        index += 1;
                        continue;
                    }

                    // The source may be gone once the callback returns, so
                    // anything that touches it happens now.
                    if let Some(timeout_us) = source.timeout_us {
                        source.due = stop_time.saturating_add(timeout_us);
                    }
                    source.triggered = true;
                    fire = Some((Rc::clone(&source.cb), source.key, fd, revents));
                    break;
                }
                fire
            };

            let (cb, key, fd, revents) = match fire {
                Some(fire) => fire,
                None => break,
            };
            any_triggered = true;

            trace!("callback for event source {} with event mask {:?}", key, revents);
            let keep = (&mut *cb.borrow_mut())(self, fd, revents);
            if !keep {
                // The callback may already have removed itself; the
                // registry logs that case and it stays non-fatal.
                let _ = self.source_remove_inner(key);
            }

            // Check the abort flag after every callback rather than once
            // per iteration, to keep the stop latency down.
            if !stopped {
                stopped = self.check_aborted();
            }

            // The callback may have changed the source list; rescan from
            // the top. `triggered` prevents duplicate fires.
            index = 0;
        }

        // Check for abort at least once per iteration.
        if !any_triggered {
            self.check_aborted();
        }

        Ok(())
    }

    /// Consume a pending abort request, running the synchronous stop path
    /// when one was set. Returns whether the session was stopped.
    pub(crate) fn check_aborted(&self) -> bool {
        let stop = std::mem::take(&mut self.stop.lock().unwrap().abort);
        if stop {
            self.stop_sync();
        }
        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, DeadlineProvider};
    use crate::device::{ChannelKind, Device, Driver, SignalChannel};
    use crate::session::PollDesc;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn session_with_device() -> Session {
        let session = Session::new(Rc::new(Context::new()));
        session.dev_add(&Device::new(None, vec![])).unwrap();
        session
    }

    #[test]
    fn run_without_devices_is_rejected() {
        let session = Session::new(Rc::new(Context::new()));
        assert!(matches!(session.run(), Err(SessionError::NoDevices)));
    }

    #[test]
    fn run_returns_once_registry_is_empty() {
        let session = session_with_device();
        assert!(session.run().is_ok());
        assert!(!session.is_running());
    }

    #[test]
    fn timer_fanout_fire_counts() {
        let session = session_with_device();
        let start = Instant::now();
        let counts: Vec<Rc<Cell<u32>>> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();

        for (ms, count) in [(10u64, &counts[0]), (20, &counts[1]), (40, &counts[2])] {
            let count = Rc::clone(count);
            session
                .source_add_timer(Duration::from_millis(ms), move |_, _, _| {
                    count.set(count.get() + 1);
                    start.elapsed() < Duration::from_millis(100)
                })
                .unwrap();
        }
        session.run().unwrap();

        let (c10, c20, c40) = (counts[0].get(), counts[1].get(), counts[2].get());
        assert!((8..=12).contains(&c10), "10 ms timer fired {} times", c10);
        assert!((4..=7).contains(&c20), "20 ms timer fired {} times", c20);
        assert!((2..=4).contains(&c40), "40 ms timer fired {} times", c40);
    }

    #[test]
    fn source_removed_when_callback_returns_false() {
        let session = session_with_device();
        let fires = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&fires);
        session
            .source_add_timer(Duration::from_millis(5), move |_, _, _| {
                counter.set(counter.get() + 1);
                counter.get() < 3
            })
            .unwrap();

        let start = Instant::now();
        session.run().unwrap();

        assert_eq!(fires.get(), 3, "callback must run exactly three times");
        assert_eq!(session.source_count(), 0, "source must be gone");
        assert!(
            start.elapsed() < Duration::from_millis(60),
            "run must return as soon as the registry drains"
        );
    }

    #[test]
    fn callback_may_add_sources_mid_dispatch() {
        let session = session_with_device();
        let start = Instant::now();
        let first = Rc::new(Cell::new(0u32));
        let second = Rc::new(Cell::new(0u32));
        let spawned = Rc::new(Cell::new(false));

        let first_cb = Rc::clone(&first);
        let second_cb = Rc::clone(&second);
        let spawned_cb = Rc::clone(&spawned);
        session
            .source_add_timer(Duration::from_millis(10), move |session, _, _| {
                first_cb.set(first_cb.get() + 1);
                if !spawned_cb.get() {
                    spawned_cb.set(true);
                    let count = Rc::clone(&second_cb);
                    session
                        .source_add_timer(Duration::from_millis(10), move |_, _, _| {
                            count.set(count.get() + 1);
                            start.elapsed() < Duration::from_millis(100)
                        })
                        .unwrap();
                }
                start.elapsed() < Duration::from_millis(100)
            })
            .unwrap();

        session.run().unwrap();

        let total = first.get() + second.get();
        assert!(
            (14..=22).contains(&total),
            "expected roughly 19 combined fires, got {} + {}",
            first.get(),
            second.get()
        );
        assert!(second.get() >= 6, "source added mid-run must participate");
    }

    struct StopDriver {
        key: Cell<Option<SourceKey>>,
    }

    impl Driver for StopDriver {
        fn name(&self) -> &str {
            "stub-la"
        }
        fn dev_open(&self, _device: &Rc<Device>) -> crate::Result<()> {
            Ok(())
        }
        fn acquisition_start(&self, _session: &Session, _device: &Rc<Device>) -> crate::Result<()> {
            Ok(())
        }
        fn acquisition_stop(&self, session: &Session, _device: &Rc<Device>) -> crate::Result<()> {
            if let Some(key) = self.key.get() {
                let _ = session.source_remove_key(key);
            }
            Ok(())
        }
    }

    #[test]
    fn stop_from_foreign_thread_ends_run_quickly() {
        let session = Session::new(Rc::new(Context::new()));
        let driver = Rc::new(StopDriver {
            key: Cell::new(None),
        });
        let device = Device::new(
            Some(Rc::clone(&driver) as Rc<dyn Driver>),
            vec![SignalChannel::new(0, ChannelKind::Logic, true, "D0")],
        );
        session.dev_add(&device).unwrap();
        session.start().unwrap();

        let key = session
            .source_add_timer(Duration::from_millis(1), |_, _, _| {
                thread::sleep(Duration::from_millis(5));
                true
            })
            .unwrap();
        driver.key.set(Some(key));

        let handle = session.stop_handle();
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            let stopped_at = Instant::now();
            handle.stop();
            tx.send(stopped_at).unwrap();
        });

        session.run().unwrap();
        let returned_at = Instant::now();
        let stopped_at = rx.recv().unwrap();

        assert!(
            returned_at.duration_since(stopped_at) < Duration::from_millis(100),
            "run must return within one callback plus one poll cycle"
        );
        assert!(!session.is_running());
        assert_eq!(session.source_count(), 0);
    }

    #[test]
    fn timers_do_not_fire_in_io_iterations() {
        let session = session_with_device();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(&[0x55]).unwrap(); // keep `a` readable throughout

        let io_live = Rc::new(Cell::new(true));
        let io_fires = Rc::new(Cell::new(0u32));
        let timer_fires = Rc::new(Cell::new(0u32));
        let violations = Rc::new(Cell::new(0u32));

        let live = Rc::clone(&io_live);
        let fires = Rc::clone(&io_fires);
        session
            .source_add(a.as_raw_fd(), PollFlags::POLLIN, None, move |_, _, revents| {
                assert!(revents.contains(PollFlags::POLLIN));
                fires.set(fires.get() + 1);
                // Stretch the I/O phase past the timer's deadline.
                thread::sleep(Duration::from_millis(3));
                if fires.get() == 3 {
                    live.set(false);
                    return false;
                }
                true
            })
            .unwrap();

        let live = Rc::clone(&io_live);
        let fires = Rc::clone(&timer_fires);
        let bad = Rc::clone(&violations);
        session
            .source_add_timer(Duration::from_millis(5), move |_, _, revents| {
                assert!(revents.is_empty(), "pure timeout must carry no events");
                if live.get() {
                    bad.set(bad.get() + 1);
                }
                fires.set(fires.get() + 1);
                fires.get() < 3
            })
            .unwrap();

        session.run().unwrap();

        assert_eq!(violations.get(), 0, "timer fired while I/O was pending");
        assert_eq!(io_fires.get(), 3);
        assert_eq!(timer_fires.get(), 3);
    }

    #[test]
    fn multi_descriptor_source_gets_sentinel_fd() {
        let session = session_with_device();
        let (a, b) = UnixStream::pair().unwrap();

        let seen_fd = Rc::new(Cell::new(0));
        let seen = Rc::clone(&seen_fd);
        session
            .source_add_pollfds(
                &[
                    PollDesc::new(a.as_raw_fd(), PollFlags::POLLOUT),
                    PollDesc::new(b.as_raw_fd(), PollFlags::POLLOUT),
                ],
                Some(Duration::from_millis(100)),
                move |_, fd, revents| {
                    assert!(revents.contains(PollFlags::POLLOUT));
                    seen.set(fd);
                    false
                },
            )
            .unwrap();

        session.run().unwrap();
        assert_eq!(seen_fd.get(), -1, "descriptor sets must pass the sentinel fd");
    }

    struct FixedDeadline {
        key: SourceKey,
        timeout_us: i64,
    }

    impl DeadlineProvider for FixedDeadline {
        fn source_key(&self) -> SourceKey {
            self.key
        }
        fn next_timeout_us(&self) -> crate::Result<Option<i64>> {
            Ok(Some(self.timeout_us))
        }
    }

    #[test]
    fn external_deadline_wakes_provider_source() {
        let ctx = Rc::new(Context::new());
        let session = Session::new(Rc::clone(&ctx));
        session.dev_add(&Device::new(None, vec![])).unwrap();

        // Never written to: the source would block forever on I/O alone.
        let (a, _b) = UnixStream::pair().unwrap();
        ctx.set_deadline_provider(Rc::new(FixedDeadline {
            key: SourceKey::Fd(a.as_raw_fd()),
            timeout_us: 5_000,
        }));

        let fires = Rc::new(Cell::new(0u32));
        let count = Rc::clone(&fires);
        session
            .source_add(a.as_raw_fd(), PollFlags::POLLIN, None, move |_, _, revents| {
                assert!(revents.is_empty(), "deadline wakeups carry no events");
                count.set(count.get() + 1);
                count.get() < 2
            })
            .unwrap();

        let start = Instant::now();
        session.run().unwrap();

        assert_eq!(fires.get(), 2);
        assert!(
            start.elapsed() >= Duration::from_millis(8),
            "each wakeup must wait out the external deadline"
        );
        assert!(
            ctx.deadline_provider().is_none(),
            "removing the provider's source must deactivate it"
        );
    }

    struct BrokenDeadline(SourceKey);

    impl DeadlineProvider for BrokenDeadline {
        fn source_key(&self) -> SourceKey {
            self.0
        }
        fn next_timeout_us(&self) -> crate::Result<Option<i64>> {
            Err(SessionError::Deadline("transfer subsystem gone".into()))
        }
    }

    #[test]
    fn provider_error_aborts_run() {
        let ctx = Rc::new(Context::new());
        let session = Session::new(Rc::clone(&ctx));
        session.dev_add(&Device::new(None, vec![])).unwrap();
        ctx.set_deadline_provider(Rc::new(BrokenDeadline(SourceKey::Timer(999))));

        session
            .source_add_timer(Duration::from_millis(10), |_, _, _| true)
            .unwrap();

        let err = session.run().unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Operational);
        assert!(!session.is_running());
    }
}
