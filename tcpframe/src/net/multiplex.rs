use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slog::Logger;

const POLL_TICK: Duration = Duration::from_millis(25);
const SELECT_TIMEOUT_MICROS: i64 = 250;

/// Returns `true` to stay registered, `false` to be dropped from the registry.
/// Unregistration triggered this way is applied by the poll loop itself, still
/// under the registry lock, so a callback never has to re-enter `unregister`.
type Callback = Box<dyn FnMut(RawFd) -> bool + Send>;

struct Registration {
    fd: RawFd,
    callback: Option<Callback>,
}

/// Background-thread socket multiplexer built directly on `select(2)` rather than
/// an edge-triggered readiness API: registration, unregistration and the poll loop
/// are all serialized behind one mutex, and the callback for a ready socket runs
/// while that mutex is held, so a callback that unregisters itself mid-call can
/// never race a concurrent `register`.
pub struct Multiplexer {
    registry: Arc<Mutex<Vec<Registration>>>,
    cursor: Arc<Mutex<usize>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn start(log: Logger) -> Multiplexer {
        let registry: Arc<Mutex<Vec<Registration>>> = Arc::new(Mutex::new(Vec::new()));
        let cursor = Arc::new(Mutex::new(0usize));
        let running = Arc::new(AtomicBool::new(true));

        let thread_registry = Arc::clone(&registry);
        let thread_cursor = Arc::clone(&cursor);
        let thread_running = Arc::clone(&running);

        let handle = thread::spawn(move || {
            poll_loop(thread_registry, thread_cursor, thread_running, log);
        });

        Multiplexer {
            registry,
            cursor,
            running,
            handle: Some(handle),
        }
    }

    /// Registers `fd`; `callback` runs on the multiplexer's thread whenever `fd`
    /// becomes readable. A freshly registered socket with no callback yet set is
    /// skipped by the poll loop but keeps its slot (and its place in the
    /// round-robin rotation).
    pub fn register(&self, fd: RawFd, callback: Callback) {
        let mut registry = self.registry.lock().unwrap();
        registry.push(Registration {
            fd,
            callback: Some(callback),
        });
    }

    pub fn unregister(&self, fd: RawFd) {
        let mut registry = self.registry.lock().unwrap();
        registry.retain(|r| r.fd != fd);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    registry: Arc<Mutex<Vec<Registration>>>,
    cursor: Arc<Mutex<usize>>,
    running: Arc<AtomicBool>,
    log: Logger,
) {
    while running.load(Ordering::SeqCst) {
        {
            let mut guard = registry.lock().unwrap();
            let len = guard.len();
            if len > 0 {
                let mut cursor_guard = cursor.lock().unwrap();
                let start = *cursor_guard % len;
                let batch_size = len.min(libc::FD_SETSIZE);

                let mut fd_set: libc::fd_set = unsafe { mem::zeroed() };
                unsafe { libc::FD_ZERO(&mut fd_set) };
                let mut max_fd: RawFd = -1;
                let mut batch_fds: Vec<RawFd> = Vec::with_capacity(batch_size);

                for i in 0..batch_size {
                    let idx = (start + i) % len;
                    let fd = guard[idx].fd;
                    unsafe { libc::FD_SET(fd, &mut fd_set) };
                    max_fd = max_fd.max(fd);
                    batch_fds.push(fd);
                }

                *cursor_guard = (start + batch_size) % len;
                drop(cursor_guard);

                let mut timeout = libc::timeval {
                    tv_sec: 0,
                    tv_usec: SELECT_TIMEOUT_MICROS,
                };

                let ready = unsafe {
                    libc::select(
                        max_fd + 1,
                        &mut fd_set,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        &mut timeout,
                    )
                };

                if ready < 0 {
                    slog::error!(log, "select() failed"; "errno" => std::io::Error::last_os_error().raw_os_error());
                } else if ready > 0 {
                    slog::trace!(log, "poll tick"; "ready" => ready);
                    let mut drop_fds: Vec<RawFd> = Vec::new();
                    for registration in guard.iter_mut() {
                        if !batch_fds.contains(&registration.fd) {
                            continue;
                        }
                        if unsafe { libc::FD_ISSET(registration.fd, &fd_set) } {
                            if let Some(callback) = registration.callback.as_mut() {
                                if !callback(registration.fd) {
                                    drop_fds.push(registration.fd);
                                }
                            }
                        }
                    }
                    if !drop_fds.is_empty() {
                        guard.retain(|r| !drop_fds.contains(&r.fd));
                    }
                }
            }
        }
        thread::sleep(POLL_TICK);
    }
}
