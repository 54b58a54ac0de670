//! Readiness wait: one `epoll` instance per scheduler, with a private
//! `eventfd` used by other carriers to wake this one out of a blocking
//! wait when they post a cross-carrier message.
//!
//! Only the notification descriptor is ever registered today; readiness
//! delegation for arbitrary file descriptors ([`crate::delegate`]) is
//! surfaced in the public API but not wired into this bus (see
//! `SPEC_FULL.md` for why). [`EventBus::wait`] is written generically over
//! "whatever event came back" regardless, so wiring a real fd in later
//! does not change its shape.

use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

const NOTIFY_TAG: u64 = 0;
const MAX_EVENTS_FLOOR: usize = 8;

/// What a single returned `epoll` event was tagged with.
pub(crate) enum BusEvent {
    /// The private wake-up descriptor fired; its 8-byte counter has
    /// already been drained by the time this is returned.
    Notification,
    /// An event came back for a descriptor this bus never registered.
    /// Unreachable today since nothing but the notify fd is ever added,
    /// but kept so the dispatch loop has somewhere honest to send an
    /// event it doesn't recognize rather than silently ignoring it.
    Unrecognized,
}

pub(crate) struct EventBus {
    epoll_fd: RawFd,
    notify_fd: RawFd,
    buffer: Vec<libc::epoll_event>,
}

impl EventBus {
    pub fn new(event_buffer_capacity: usize) -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::NotificationSetup(std::io::Error::last_os_error()));
        }

        let notify_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if notify_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::NotificationSetup(err));
        }

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: NOTIFY_TAG,
        };
        let ctl_rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, notify_fd, &mut event) };
        if ctl_rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(notify_fd);
                libc::close(epoll_fd);
            }
            return Err(Error::NotificationSetup(err));
        }

        Ok(EventBus {
            epoll_fd,
            notify_fd,
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; event_buffer_capacity.max(MAX_EVENTS_FLOOR)],
        })
    }

    /// Blocks for at most `timeout_ms` (`-1` blocks indefinitely, `0`
    /// polls), returning every event that was ready. Drains the
    /// notification counter inline for any [`BusEvent::Notification`]
    /// before returning it, so callers never need to touch the fd.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<BusEvent>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.buffer.as_ptr() as *mut libc::epoll_event,
                self.buffer.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(Error::Readiness(err));
        }

        let mut out = Vec::with_capacity(n as usize);
        for event in &self.buffer[..n as usize] {
            if event.u64 == NOTIFY_TAG {
                self.drain_notify();
                out.push(BusEvent::Notification);
            } else {
                out.push(BusEvent::Unrecognized);
            }
        }
        Ok(out)
    }

    fn drain_notify(&self) {
        let mut counter: u64 = 0;
        loop {
            let rc = unsafe {
                libc::read(
                    self.notify_fd,
                    &mut counter as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // EAGAIN just means another drain already beat us to it.
            break;
        }
    }

    /// Wakes this bus's `wait` out of a blocking call.
    pub fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.notify_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.notify_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_wakes_a_blocking_wait() {
        let bus = EventBus::new(8).unwrap();
        bus.notify();
        let events = bus.wait(1000).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BusEvent::Notification));
    }

    #[test]
    fn wait_with_zero_timeout_returns_promptly_when_idle() {
        let bus = EventBus::new(8).unwrap();
        let events = bus.wait(0).unwrap();
        assert!(events.is_empty());
    }
}
