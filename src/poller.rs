//! The readiness oracle: reconciles the kernel's interest set with each
//! [`Channel`]'s desired events and reports ready channels per `poll`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use crate::channel::{Channel, ChannelIndex};
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Abstract readiness interface. `EpollPoller` is the only implementation
/// this crate ships (cross-platform multiplexer selection is out of scope),
/// but keeping the contract as a trait documents the seam and matches how
/// the reference implementation separates `Poller` from `EPollPoller`.
pub trait Poller {
    /// Blocks up to `timeout_ms` (negative = indefinite, 0 = non-blocking)
    /// for any registered fd to become ready. Populates `active_channels`
    /// with a pointer to each ready Channel, after writing its reported
    /// revents mask into that Channel. Returns the timestamp captured
    /// immediately after the kernel call returned.
    ///
    /// # Safety
    /// Entries in `active_channels` are only valid to dereference while the
    /// owning `EventLoop`'s thread still holds them (i.e. immediately, within
    /// the same poll iteration) — the pointer is only as good as the
    /// registration that produced it.
    fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<*const Channel>,
    ) -> io::Result<Timestamp>;

    fn update_channel(&mut self, channel: &Channel);
    fn remove_channel(&mut self, channel: &Channel);
    fn has_channel(&self, channel: &Channel) -> bool;
}

pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, *const Channel>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 on success returns a valid, owned fd.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(EpollPoller {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn update(&self, operation: libc::c_int, channel: &Channel) {
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        event.events = channel.events() as u32;
        event.u64 = channel as *const Channel as u64;
        let fd = channel.fd();

        let res = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), operation, fd, &mut event) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if operation == libc::EPOLL_CTL_DEL {
                log::error!("epoll_ctl(DEL) failed for fd {fd}: {err}");
            } else {
                panic!("epoll_ctl({operation}) failed for fd {fd}: {err}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<*const Channel>,
    ) -> io::Result<Timestamp> {
        log::trace!("fd total count {}", self.channels.len());
        active_channels.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                log::trace!("EpollPoller::poll interrupted, retrying next iteration");
                return Ok(now);
            }
            return Err(err);
        }

        let n = n as usize;
        if n == self.events.len() {
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }

        for event in &self.events[..n] {
            let channel_ptr = event.u64 as *const Channel;
            // SAFETY: the identity stored in `u64` is the address of a
            // Channel that is still registered (and thus still alive, since
            // owners remove their Channel before dropping it).
            unsafe { (*channel_ptr).set_revents(event.events as i32) };
            active_channels.push(channel_ptr);
        }

        Ok(now)
    }

    fn update_channel(&mut self, channel: &Channel) {
        let index = channel.index();
        log::trace!("fd = {} events = {}", channel.fd(), channel.events());

        match index {
            ChannelIndex::New | ChannelIndex::Deleted => {
                let fd = channel.fd();
                if index == ChannelIndex::New {
                    debug_assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel as *const Channel);
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_index(ChannelIndex::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelIndex::Added => {
                debug_assert!(self.channels.contains_key(&channel.fd()));
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_index(ChannelIndex::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug_assert!(self.channels.contains_key(&fd));
        debug_assert!(channel.is_none_event());

        let index = channel.index();
        debug_assert!(index == ChannelIndex::Added || index == ChannelIndex::Deleted);
        self.channels.remove(&fd);
        if index == ChannelIndex::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(ChannelIndex::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|&p| std::ptr::eq(p, channel as *const Channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_poller_has_no_channels() {
        let poller = EpollPoller::new().expect("epoll_create1");
        assert_eq!(poller.channels.len(), 0);
    }

    #[test]
    fn event_list_starts_at_init_size() {
        let poller = EpollPoller::new().expect("epoll_create1");
        assert_eq!(poller.events.len(), INIT_EVENT_LIST_SIZE);
    }
}
