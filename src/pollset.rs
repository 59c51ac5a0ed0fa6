//! The single `poll(2)` wait-descriptor set: one IRQ GPIO slot, N listening-socket
//! slots, N accepted-connection slots, as indexed accessors over one owned array.

use std::os::fd::RawFd;

use crate::{N_CHANNEL, error::BridgeError};

const N_POLLFDS: usize = 1 + 2 * N_CHANNEL;
const GPIO_INDEX: usize = 0;

/// Owns the flat `pollfd` array passed to `poll(2)` each cycle.
///
/// Index layout: `[irq, listen_0..listen_{N-1}, conn_0..conn_{N-1}]`.
pub struct PollSet {
    fds: [libc::pollfd; N_POLLFDS],
}

impl PollSet {
    pub fn new(irq_fd: RawFd) -> Self {
        let mut fds = [libc::pollfd { fd: -1, events: 0, revents: 0 }; N_POLLFDS];
        fds[GPIO_INDEX] = libc::pollfd { fd: irq_fd, events: libc::POLLPRI, revents: 0 };
        Self { fds }
    }

    fn listen_index(chan: usize) -> usize {
        1 + chan
    }

    fn conn_index(chan: usize) -> usize {
        1 + N_CHANNEL + chan
    }

    pub fn set_listen_fd(&mut self, chan: usize, fd: RawFd) {
        self.fds[Self::listen_index(chan)] = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    }

    pub fn irq_revents(&self) -> i16 {
        self.fds[GPIO_INDEX].revents
    }

    pub fn listen_revents(&self, chan: usize) -> i16 {
        self.fds[Self::listen_index(chan)].revents
    }

    pub fn conn_revents(&self, chan: usize) -> i16 {
        self.fds[Self::conn_index(chan)].revents
    }

    pub fn arm_listen(&mut self, chan: usize) {
        self.fds[Self::listen_index(chan)].events = libc::POLLIN;
    }

    pub fn disarm_listen(&mut self, chan: usize) {
        self.fds[Self::listen_index(chan)].events = 0;
    }

    pub fn set_conn_fd(&mut self, chan: usize, fd: RawFd) {
        let i = Self::conn_index(chan);
        self.fds[i] = libc::pollfd { fd, events: libc::POLLIN | libc::POLLOUT, revents: 0 };
    }

    pub fn clear_conn_fd(&mut self, chan: usize) {
        self.fds[Self::conn_index(chan)] = libc::pollfd { fd: -1, events: 0, revents: 0 };
    }

    pub fn clear_conn_interest(&mut self, chan: usize, interest: i16) {
        self.fds[Self::conn_index(chan)].events &= !interest;
    }

    pub fn arm_conn_interest(&mut self, chan: usize, interest: i16) {
        self.fds[Self::conn_index(chan)].events |= interest;
    }

    /// Zeros every `revents` field, then blocks in `poll(2)` for up to `timeout_ms`.
    /// A timeout (return value 0) is not an error; the loop just continues.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<(), BridgeError> {
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }

        let rc = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
        };
        if rc < 0 {
            return Err(BridgeError::Poll(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn set_revents_for_test(&mut self, index: usize, revents: i16) {
        self.fds[index].revents = revents;
    }

    #[cfg(any(test, feature = "test-util"))]
    pub const fn irq_index_for_test() -> usize {
        GPIO_INDEX
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn listen_index_for_test(chan: usize) -> usize {
        Self::listen_index(chan)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn conn_index_for_test(chan: usize) -> usize {
        Self::conn_index(chan)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn events_for_test(&self, index: usize) -> i16 {
        self.fds[index].events
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn fd_for_test(&self, index: usize) -> RawFd {
        self.fds[index].fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_disarm_listen_toggle_pollin() {
        let mut poll = PollSet::new(-1);
        poll.set_listen_fd(0, 7);
        assert_eq!(poll.events_for_test(PollSet::listen_index_for_test(0)), libc::POLLIN);

        poll.disarm_listen(0);
        assert_eq!(poll.events_for_test(PollSet::listen_index_for_test(0)), 0);

        poll.arm_listen(0);
        assert_eq!(poll.events_for_test(PollSet::listen_index_for_test(0)), libc::POLLIN);
    }

    #[test]
    fn conn_interest_bits_clear_and_set_independently() {
        let mut poll = PollSet::new(-1);
        poll.set_conn_fd(1, 9);
        let idx = PollSet::conn_index_for_test(1);
        assert_eq!(poll.events_for_test(idx), libc::POLLIN | libc::POLLOUT);

        poll.clear_conn_interest(1, libc::POLLIN);
        assert_eq!(poll.events_for_test(idx), libc::POLLOUT);

        poll.arm_conn_interest(1, libc::POLLIN);
        assert_eq!(poll.events_for_test(idx), libc::POLLIN | libc::POLLOUT);
    }

    #[test]
    fn clear_conn_fd_resets_slot() {
        let mut poll = PollSet::new(-1);
        poll.set_conn_fd(2, 11);
        poll.clear_conn_fd(2);
        let idx = PollSet::conn_index_for_test(2);
        assert_eq!(poll.fd_for_test(idx), -1);
        assert_eq!(poll.events_for_test(idx), 0);
    }

    #[test]
    fn wait_clears_stale_revents_before_polling() {
        let mut poll = PollSet::new(-1);
        let idx = PollSet::irq_index_for_test();
        poll.set_revents_for_test(idx, libc::POLLPRI);
        poll.wait(0).unwrap();
        // irq fd is -1 (ignored by poll(2)); revents must have been zeroed.
        assert_eq!(poll.irq_revents(), 0);
    }
}
