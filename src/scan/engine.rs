use std::{io, os::fd::RawFd, time::Duration};

use crate::{error::ScanError, interrupt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Read => libc::POLLIN,
            Interest::ReadWrite => libc::POLLIN | libc::POLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Source {
    pub fd: RawFd,
    pub interest: Interest,
}

impl Source {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self { fd, interest }
    }
}

/// A scan state machine driven by [`run`].
///
/// Handlers receive the index of the ready source within [`Driver::sources`]
/// and must tolerate being called any number of times per loop pass.
pub trait Driver {
    type Output;

    /// Sockets to watch. The set is fixed for the whole scan.
    fn sources(&self) -> Vec<Source>;

    fn on_readable(&mut self, token: usize);

    fn on_writable(&mut self, token: usize);

    /// Work queue drained and nothing left in flight.
    fn is_complete(&mut self) -> bool;

    /// Upper bound on a single wait, usually the time until the next
    /// pending probe expires. `None` waits until a source is ready.
    fn poll_timeout(&mut self) -> Option<Duration> {
        None
    }

    /// Consumes the driver, releasing its sockets.
    fn finish(self) -> Self::Output;
}

fn poll_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(t) => t.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    }
}

/// Runs `driver` until it completes or SIGINT arrives.
pub fn run<D: Driver>(driver: D) -> Result<D::Output, ScanError> {
    run_until(driver, interrupt::requested)
}

/// Runs `driver` until it completes or `interrupted` returns true. The
/// driver is dropped on every return path, so its sockets are closed even
/// when the scan is interrupted. `EINTR` alone only restarts the wait.
pub fn run_until<D, F>(mut driver: D, interrupted: F) -> Result<D::Output, ScanError>
where
    D: Driver,
    F: Fn() -> bool,
{
    let mut fds = driver
        .sources()
        .iter()
        .map(|src| libc::pollfd {
            fd: src.fd,
            events: src.interest.events(),
            revents: 0,
        })
        .collect::<Vec<_>>();

    log::debug!("Polling {} socket(s)", fds.len());

    let mut passes: u64 = 0;

    loop {
        if driver.is_complete() {
            log::debug!("Scan loop finished after {} pass(es)", passes);
            return Ok(driver.finish());
        }

        if interrupted() {
            log::debug!("Scan loop interrupted after {} pass(es)", passes);
            return Err(ScanError::Interrupted);
        }

        let timeout = poll_millis(driver.poll_timeout());
        fds.iter_mut().for_each(|pfd| pfd.revents = 0);

        // SAFETY: `fds` is a live, properly sized array of pollfd structs.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        passes += 1;

        if ready < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ScanError::PollFailed(e));
        }

        for token in 0..fds.len() {
            let revents = fds[token].revents;

            if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                driver.on_readable(token);
                if driver.is_complete() {
                    break;
                }
            }

            if revents & libc::POLLOUT != 0 {
                driver.on_writable(token);
                if driver.is_complete() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        collections::HashSet,
        os::{fd::AsRawFd, unix::net::UnixDatagram},
        rc::Rc,
        thread,
        time::Instant,
    };

    use super::*;
    use crate::scan::ledger::Ledger;

    /// Sends every queued id through a socket pair and reads it back.
    /// Ids listed in `drop` are recorded but never written.
    struct Loopback {
        near: UnixDatagram,
        far: UnixDatagram,
        queue: Vec<u16>,
        drop: HashSet<u16>,
        ledger: Ledger,
        echoed: Vec<u16>,
        released: Rc<Cell<bool>>,
    }

    impl Drop for Loopback {
        fn drop(&mut self) {
            self.released.set(true);
        }
    }

    impl Loopback {
        fn new(queue: Vec<u16>, drop: HashSet<u16>, ttl: Duration) -> Self {
            let (near, far) = UnixDatagram::pair().unwrap();
            near.set_nonblocking(true).unwrap();
            Self {
                near,
                far,
                queue,
                drop,
                ledger: Ledger::new(ttl),
                echoed: Vec::new(),
                released: Rc::default(),
            }
        }
    }

    impl Driver for Loopback {
        type Output = Vec<u16>;

        fn sources(&self) -> Vec<Source> {
            vec![Source::new(self.near.as_raw_fd(), Interest::ReadWrite)]
        }

        fn on_readable(&mut self, _: usize) {
            let mut buf = [0; 2];
            if let Ok(2) = self.near.recv(&mut buf) {
                let id = u16::from_be_bytes(buf);
                if self.ledger.remove(id).is_some() {
                    self.echoed.push(id);
                }
            }
        }

        fn on_writable(&mut self, _: usize) {
            if let Some(id) = self.queue.pop() {
                if !self.drop.contains(&id) {
                    self.far.send(&id.to_be_bytes()).unwrap();
                }
                self.ledger.put(id, Instant::now());
            }
        }

        fn is_complete(&mut self) -> bool {
            self.queue.is_empty() && self.ledger.is_empty()
        }

        fn poll_timeout(&mut self) -> Option<Duration> {
            self.ledger.next_expiry()
        }

        fn finish(mut self) -> Vec<u16> {
            let mut echoed = std::mem::take(&mut self.echoed);
            echoed.sort_unstable();
            echoed
        }
    }

    #[test]
    fn empty_queue_finishes_immediately() {
        let driver = Loopback::new(vec![], HashSet::new(), Duration::from_secs(5));
        assert_eq!(run(driver).unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn answered_items_are_collected() {
        let driver = Loopback::new(vec![3, 1, 2], HashSet::new(), Duration::from_secs(5));
        let start = Instant::now();
        assert_eq!(run(driver).unwrap(), vec![1, 2, 3]);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn silent_items_resolve_by_expiry() {
        let ttl = Duration::from_millis(300);
        let driver = Loopback::new(vec![1, 2, 3], HashSet::from([2]), ttl);

        let start = Instant::now();
        assert_eq!(run(driver).unwrap(), vec![1, 3]);

        let elapsed = start.elapsed();
        assert!(elapsed >= ttl);
        assert!(elapsed < ttl * 10);
    }

    #[test]
    fn interruption_releases_driver() {
        let ttl = Duration::from_secs(30);
        let driver = Loopback::new(vec![1, 2, 3], HashSet::from([1, 2, 3]), ttl);
        let released = Rc::clone(&driver.released);

        // Let a few passes run before the interrupt lands.
        let checks = Cell::new(0);
        let res = run_until(driver, || {
            checks.set(checks.get() + 1);
            checks.get() > 3
        });

        assert!(matches!(res, Err(ScanError::Interrupted)));
        assert!(released.get());
    }

    #[test]
    fn interruption_before_first_pass_sends_nothing() {
        let driver = Loopback::new(vec![7], HashSet::new(), Duration::from_secs(30));
        let released = Rc::clone(&driver.released);

        assert!(matches!(run_until(driver, || true), Err(ScanError::Interrupted)));
        assert!(released.get());
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn signal_without_interrupt_resumes_polling() {
        // SAFETY: the handler does nothing. SIGUSR1 is only raised below.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = ignore_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        // SAFETY: pthread_self has no preconditions.
        let polling = unsafe { libc::pthread_self() };
        let kicker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            // SAFETY: the polling thread outlives this one, it is joined below.
            unsafe { libc::pthread_kill(polling, libc::SIGUSR1) };
        });

        let ttl = Duration::from_millis(400);
        let driver = Loopback::new(vec![1, 2], HashSet::from([2]), ttl);
        let start = Instant::now();

        assert_eq!(run_until(driver, || false).unwrap(), vec![1]);
        assert!(start.elapsed() >= ttl);

        kicker.join().unwrap();
    }

    #[test]
    fn timeout_rounds_up_to_whole_millis() {
        assert_eq!(poll_millis(None), -1);
        assert_eq!(poll_millis(Some(Duration::ZERO)), 0);
        assert_eq!(poll_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(poll_millis(Some(Duration::from_millis(1500))), 1500);
    }
}
