//! The transaction loop — the core of this daemon.
//!
//! Orchestrates the channel table, poll set, SPI transactor, and sync/IRQ
//! GPIO lines through one cycle at a time. The sync line is driven high
//! unconditionally right after the header exchange completes, *before* the
//! reply's magic byte is interpreted — see the ordering note on
//! [`run_cycle`].

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, error, info, warn};

use crate::{
    channel::{
        BUFSIZE, ChannelTable, HEADER_MAGIC_REPLY, encode_header, peer_enable_bit,
        peer_inbound_len, peer_ready_for_outbound, read_outbound,
    },
    error::BridgeError,
    gpio::{IrqLine, SyncLine},
    pollset::PollSet,
    spi::{Descriptor, SpiBus},
};

const N_CHANNEL: usize = crate::channel::N_CHANNEL;
const HEADER_LEN: usize = 2 + N_CHANNEL;
const POLL_TIMEOUT_MS: i32 = 5_000;
const MAX_RETRIES: u32 = 15;

/// Non-optimizable short spin between sync transitions and SPI exchanges.
///
/// The peer's firmware uses the sync edges and this gap to position its own
/// DMA; it must not be replaced with an async sleep or removed.
fn hold_time() {
    let mut i: u32 = 1_000;
    while i != 0 {
        i -= 1;
        std::hint::black_box(i);
    }
}

/// Outcome of a single cycle, used by tests and by [`TransactionLoop::run`]'s
/// top-level loop.
#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Ran to completion (cold-start cycles with no data transfer included).
    Completed,
    /// Header magic mismatch; cycle aborted before the enable-delta/data
    /// steps. Caller should simply run another cycle.
    RetriedHeader,
}

pub struct TransactionLoop<S: SpiBus, I: IrqLine, Y: SyncLine> {
    spi: S,
    irq: I,
    sync: Y,
    channels: ChannelTable,
    poll: PollSet,
    retries: u32,
    poll_timeout_ms: i32,
}

impl<S: SpiBus, I: IrqLine, Y: SyncLine> TransactionLoop<S, I, Y> {
    /// Listen sockets start armed for POLLIN regardless of `Channel::enabled`'s
    /// default `false`, matching the reference startup sequence (see §9
    /// resolved open question 4): a client can connect and be accepted in the
    /// first cycle, before the peer has ever reported an enable bit.
    pub fn new(spi: S, irq: I, sync: Y, channels: ChannelTable) -> Self {
        let mut poll = PollSet::new(irq.raw_fd());
        for (i, ch) in channels.channels.iter().enumerate() {
            poll.set_listen_fd(i, std::os::fd::AsRawFd::as_raw_fd(&ch.listener));
        }
        Self { spi, irq, sync, channels, poll, retries: 0, poll_timeout_ms: POLL_TIMEOUT_MS }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn set_poll_timeout_for_test(&mut self, ms: i32) {
        self.poll_timeout_ms = ms;
    }

    pub fn spi_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    pub fn irq(&self) -> &I {
        &self.irq
    }

    pub fn sync(&self) -> &Y {
        &self.sync
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[cfg(test)]
    fn channels_for_test(&self) -> &crate::channel::ChannelTable {
        &self.channels
    }

    /// Runs cycles forever until `shutdown` is set, checked once per cycle
    /// boundary.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> Result<(), BridgeError> {
        while !shutdown.load(Ordering::Relaxed) {
            self.run_cycle()?;
        }
        info!("shutdown requested, exiting cleanly");
        Ok(())
    }

    /// Runs exactly one cycle.
    ///
    /// Ordering: sync-low precedes header-tx precedes sync-high precedes
    /// header-rx-interpretation — the sync line is driven high
    /// unconditionally right after the header ioctl completes, *before* the
    /// magic byte is checked.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, BridgeError> {
        self.poll.wait(self.poll_timeout_ms)?;

        if self.poll.irq_revents() & libc::POLLPRI != 0 {
            if let Err(e) = self.irq.ack() {
                return Err(BridgeError::GpioRead { gpio: "irq".to_owned(), source: e });
            }
        }

        self.sync.set_low().map_err(|e| BridgeError::GpioWrite {
            gpio: "sync".to_owned(),
            file: "value",
            source: e,
        })?;
        hold_time();

        self.process_accepts();
        self.process_connections();

        let tx = encode_header(&self.channels.channels);
        let mut rx = [0u8; HEADER_LEN];
        {
            let mut descriptors = [Descriptor::Tx(&tx), Descriptor::Rx(&mut rx)];
            self.spi.transfer(&mut descriptors).map_err(BridgeError::SpiIoctl)?;
        }

        self.sync.set_high().map_err(|e| BridgeError::GpioWrite {
            gpio: "sync".to_owned(),
            file: "value",
            source: e,
        })?;

        if rx[0] != HEADER_MAGIC_REPLY {
            self.retries += 1;
            error!(retries = self.retries, reply = ?rx, "invalid header reply");
            if self.retries > MAX_RETRIES {
                return Err(BridgeError::SustainedMismatch(self.retries));
            }
            return Ok(CycleOutcome::RetriedHeader);
        }
        self.retries = 0;

        self.apply_enable_deltas(&rx);

        hold_time();

        self.data_exchange(&rx)?;

        Ok(CycleOutcome::Completed)
    }

    /// Accepts at most one connection per channel whose listen socket is
    /// readable. Accept failures are non-fatal — logged and skipped, leaving
    /// the listen socket armed for the next cycle.
    fn process_accepts(&mut self) {
        for i in 0..N_CHANNEL {
            if self.poll.listen_revents(i) & libc::POLLIN == 0 {
                continue;
            }
            match self.channels.channels[i].listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(channel = i, error = %e, "couldn't set accepted socket nonblocking");
                        continue;
                    }
                    info!(channel = i, "accepted connection");
                    self.poll.set_conn_fd(i, std::os::fd::AsRawFd::as_raw_fd(&stream));
                    self.channels.channels[i].conn = Some(stream);
                    self.channels.channels[i].open = true;
                    self.poll.disarm_listen(i);
                }
                Err(e) => {
                    warn!(channel = i, error = %e, "accept failed, will retry next cycle");
                }
            }
        }
    }

    /// Reads, closes, and latches writable for each accepted connection.
    fn process_connections(&mut self) {
        for i in 0..N_CHANNEL {
            if self.channels.channels[i].conn.is_none() {
                continue;
            }

            let revents = self.poll.conn_revents(i);
            let mut to_close = false;

            if revents & libc::POLLIN != 0 {
                self.poll.clear_conn_interest(i, libc::POLLIN);
                match read_outbound(&mut self.channels.channels[i]) {
                    Ok(true) => {
                        debug!(channel = i, len = self.channels.channels[i].out_len, "read bytes");
                    }
                    Ok(false) => to_close = true,
                    Err(e) => {
                        warn!(channel = i, error = %e, "client read error");
                        to_close = true;
                    }
                }
            }

            let hangup = revents & (libc::POLLHUP | libc::POLLERR | libc::POLLRDHUP) != 0;
            if to_close || hangup {
                self.channels.channels[i].close_connection(i);
                self.poll.clear_conn_fd(i);
                self.poll.arm_listen(i);
                continue;
            }

            if revents & libc::POLLOUT != 0 {
                self.poll.clear_conn_interest(i, libc::POLLOUT);
                self.channels.channels[i].writable = true;
                debug!(channel = i, "writable");
            }
        }
    }

    /// Compares each channel's normalized enable bit against the stored
    /// value and applies the transition.
    fn apply_enable_deltas(&mut self, rx: &[u8; HEADER_LEN]) {
        for i in 0..N_CHANNEL {
            let new_enabled = peer_enable_bit(rx, i);
            let ch = &mut self.channels.channels[i];
            if new_enabled == ch.enabled {
                continue;
            }

            if new_enabled {
                info!(channel = i, "peer enabled channel");
                self.poll.arm_listen(i);
            } else {
                info!(channel = i, "peer disabled channel");
                ch.close_connection(i);
                self.poll.clear_conn_fd(i);
                self.poll.disarm_listen(i);
            }
            ch.enabled = new_enabled;
        }
    }

    /// Builds the descriptor list from the validated header, issues the
    /// transfer if non-empty, then applies post-transfer bookkeeping (zero
    /// `out_len`/re-arm POLLIN for outbound, deliver bytes/re-arm
    /// POLLOUT/clear `writable` for inbound).
    fn data_exchange(&mut self, rx: &[u8; HEADER_LEN]) -> Result<(), BridgeError> {
        let mut tx_len: [Option<usize>; N_CHANNEL] = [None; N_CHANNEL];
        let mut rx_len: [Option<usize>; N_CHANNEL] = [None; N_CHANNEL];
        for i in 0..N_CHANNEL {
            let ch = &self.channels.channels[i];
            if peer_ready_for_outbound(rx, i) && ch.out_len > 0 {
                tx_len[i] = Some(ch.out_len);
            }
            let in_len = peer_inbound_len(rx, i);
            if ch.writable && in_len > 0 {
                rx_len[i] = Some(in_len);
            }
        }

        let descriptor_count = tx_len.iter().filter(|l| l.is_some()).count()
            + rx_len.iter().filter(|l| l.is_some()).count();
        if descriptor_count == 0 {
            return Ok(());
        }

        debug!(descriptors = descriptor_count, "performing data transfer");
        {
            // A single pass over `iter_mut` hands out one disjoint `&mut
            // Channel` per element; indexing `self.channels.channels[chan]`
            // per plan entry instead (as a prior version of this function
            // did) can't be proven disjoint across loop iterations by the
            // borrow checker and fails to compile once a cycle needs more
            // than one descriptor.
            let mut descriptors: Vec<Descriptor<'_>> = Vec::with_capacity(descriptor_count);
            for (i, ch) in self.channels.channels.iter_mut().enumerate() {
                if let Some(len) = tx_len[i] {
                    descriptors.push(Descriptor::Tx(&ch.out_buf[..len]));
                }
                if let Some(len) = rx_len[i] {
                    descriptors.push(Descriptor::Rx(&mut ch.in_buf[..len]));
                }
            }
            self.spi.transfer(&mut descriptors).map_err(BridgeError::SpiIoctl)?;
        }

        for i in 0..N_CHANNEL {
            if tx_len[i].is_some() {
                self.channels.channels[i].out_len = 0;
                self.poll.arm_conn_interest(i, libc::POLLIN);
            }
            if let Some(len) = rx_len[i] {
                self.deliver_inbound(i, len);
            }
        }

        Ok(())
    }

    fn deliver_inbound(&mut self, chan: usize, len: usize) {
        use std::io::Write;

        let ch = &mut self.channels.channels[chan];
        debug_assert!(len <= BUFSIZE);
        if let Some(conn) = ch.conn.as_mut() {
            if let Err(e) = conn.write(&ch.in_buf[..len]) {
                warn!(channel = chan, error = %e, "client write error");
            }
        }
        self.poll.arm_conn_interest(chan, libc::POLLOUT);
        ch.writable = false;
    }
}
