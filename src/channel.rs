//! Channel table: one logical byte stream multiplexed over the shared SPI link.
//!
//! One [`Channel`] per logical byte stream: its listening socket, its at-most-one
//! accepted connection, and the staging buffers for one in-flight chunk per
//! direction. `writable`/`open`/`enabled` are independent booleans — the packed
//! header-byte representation only exists transiently, at the point
//! [`encode_header`] builds the bytes actually put on the wire.

use std::{
    ffi::CString,
    io,
    mem,
    os::{
        fd::FromRawFd,
        unix::{ffi::OsStrExt, net::{UnixListener, UnixStream}},
    },
    path::Path,
};

use tracing::info;

use crate::error::BridgeError;

pub const N_CHANNEL: usize = 3;
pub const BUFSIZE: usize = 255;

/// `std::os::unix::net::UnixListener::bind` always listens with a fixed
/// backlog (128), not configurable via the safe API. The wire protocol
/// requires a true backlog of 1 — no safe wrapper exists for that, so this
/// goes through raw `socket`/`bind`/`listen` directly, same as the teacher's
/// `flux-utils` calls `sched_setscheduler` directly where libc has no safe
/// equivalent.
fn bind_unix_listener_backlog_1(path: &Path) -> io::Result<UnixListener> {
    let bytes = path.as_os_str().as_bytes();
    let c_path = CString::new(bytes).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: sockaddr_un is a plain-old-data struct; sun_path is sized
    // 108 bytes on Linux and the caller-supplied path is checked against it.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_bytes = c_path.as_bytes_with_nul();
    if path_bytes.len() > addr.sun_path.len() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    for (dst, &b) in addr.sun_path.iter_mut().zip(path_bytes.iter()) {
        *dst = b as libc::c_char;
    }
    let addr_len = (mem::size_of::<libc::sa_family_t>() + path_bytes.len()) as libc::socklen_t;

    // SAFETY: standard socket/bind/listen sequence; fd is checked for -1
    // after every call and the socket is closed (via UnixListener's Drop)
    // once ownership transfers to it below.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let addr_ptr = std::ptr::addr_of!(addr).cast::<libc::sockaddr>();
        if libc::bind(fd, addr_ptr, addr_len) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        if libc::listen(fd, 1) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        Ok(UnixListener::from_raw_fd(fd))
    }
}

pub struct Channel {
    pub listener: UnixListener,
    pub conn: Option<UnixStream>,
    pub out_buf: [u8; BUFSIZE],
    pub out_len: usize,
    pub in_buf: [u8; BUFSIZE],
    /// Client socket observed writable since last served; consumed when the
    /// loop delivers peer-sent bytes to the client.
    pub writable: bool,
    /// A client is currently accepted on this channel.
    pub open: bool,
    /// Most recent enable state published by the peer, normalized to a plain
    /// boolean.
    pub enabled: bool,
}

impl Channel {
    fn bind(socket_dir: &Path, index: usize) -> Result<Self, BridgeError> {
        let path = socket_dir.join(index.to_string());
        let _ = std::fs::remove_file(&path);

        let listener = bind_unix_listener_backlog_1(&path)
            .map_err(|source| BridgeError::SocketBind { path: path.clone(), source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| BridgeError::SocketListen { path: path.clone(), source })?;

        Ok(Self {
            listener,
            conn: None,
            out_buf: [0u8; BUFSIZE],
            out_len: 0,
            in_buf: [0u8; BUFSIZE],
            writable: false,
            open: false,
            enabled: false,
        })
    }

    /// Closes the current connection (if any), clearing outbound staging and
    /// per-channel flags. Does not touch `enabled` or the listen socket's
    /// poll interest — callers re-arm that themselves, since a client
    /// disconnect and a peer-initiated disable re-arm differently.
    pub fn close_connection(&mut self, index: usize) {
        if self.conn.take().is_some() {
            info!(channel = index, "closing connection");
        }
        self.out_len = 0;
        self.writable = false;
        self.open = false;
    }
}

pub struct ChannelTable {
    pub channels: [Channel; N_CHANNEL],
}

impl ChannelTable {
    /// Binds a backlog-1 listening socket at `<socket_dir>/<i>` for each
    /// channel.
    pub fn bind_all(socket_dir: &Path) -> Result<Self, BridgeError> {
        if !socket_dir.is_dir() {
            return Err(BridgeError::BadSocketDir(socket_dir.to_owned()));
        }

        let mut channels = Vec::with_capacity(N_CHANNEL);
        for i in 0..N_CHANNEL {
            channels.push(Channel::bind(socket_dir, i)?);
        }
        let channels: [Channel; N_CHANNEL] =
            channels.try_into().unwrap_or_else(|_| unreachable!("exactly N_CHANNEL pushed"));

        Ok(Self { channels })
    }
}

/// Builds the 5-byte host→peer header: magic, writable/open nibbles, then one
/// outbound length byte per channel.
pub fn encode_header(channels: &[Channel; N_CHANNEL]) -> [u8; 2 + N_CHANNEL] {
    let mut tx = [0u8; 2 + N_CHANNEL];
    tx[0] = 0x53;

    let mut flags = 0u8;
    for (i, ch) in channels.iter().enumerate() {
        if ch.writable {
            flags |= 1 << i;
        }
        if ch.open {
            flags |= 0x10 << i;
        }
    }
    tx[1] = flags;

    for (i, ch) in channels.iter().enumerate() {
        tx[2 + i] = ch.out_len as u8;
    }
    tx
}

pub const HEADER_MAGIC_REPLY: u8 = 0xCA;

/// True if the peer's reply accepts outbound payload from `chan` this cycle.
pub fn peer_ready_for_outbound(rx: &[u8; 2 + N_CHANNEL], chan: usize) -> bool {
    rx[1] & (1 << chan) != 0
}

/// The peer's enable bit for `chan`, normalized to a boolean. Both sides of
/// the comparison are booleans on purpose: comparing a shifted bit against
/// the literal `1` would make the "enabled" branch unreachable for any
/// channel past the first.
pub fn peer_enable_bit(rx: &[u8; 2 + N_CHANNEL], chan: usize) -> bool {
    rx[1] & (0x10 << chan) != 0
}

/// Peer-reported inbound payload length for `chan`.
pub fn peer_inbound_len(rx: &[u8; 2 + N_CHANNEL], chan: usize) -> usize {
    rx[2 + chan] as usize
}

/// A single read from a ready client socket.
///
/// Returns `Ok(true)` if bytes were read and staged into `out_buf`, `Ok(false)`
/// if the peer closed (read returned 0) or there was nothing to stage, and an
/// `Err` on a genuine read error — both `Ok(false)` and `Err` mean the caller
/// should close the connection.
pub fn read_outbound(channel: &mut Channel) -> io::Result<bool> {
    use std::io::Read;

    let conn = channel.conn.as_mut().expect("read_outbound called without a connection");
    match conn.read(&mut channel.out_buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            channel.out_len = n;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn blank_channel(listener: UnixListener) -> Channel {
        Channel {
            listener,
            conn: None,
            out_buf: [0u8; BUFSIZE],
            out_len: 0,
            in_buf: [0u8; BUFSIZE],
            writable: false,
            open: false,
            enabled: false,
        }
    }

    // Leaked on purpose: each call needs its bound sockets to outlive the
    // directory for the life of the test.
    fn fresh_socket_dir() -> &'static std::path::Path {
        Box::leak(tempfile::tempdir().unwrap().into_path().into_boxed_path())
    }

    fn channel_table_stub() -> [Channel; N_CHANNEL] {
        let dir = fresh_socket_dir();
        std::array::from_fn(|i| blank_channel(UnixListener::bind(dir.join(i.to_string())).unwrap()))
    }

    #[test]
    fn encode_header_packs_writable_and_open_nibbles() {
        let mut channels = channel_table_stub();
        channels[0].writable = true;
        channels[0].open = true;
        channels[2].open = true;
        channels[0].out_len = 7;
        channels[1].out_len = 200;

        let tx = encode_header(&channels);

        assert_eq!(tx[0], 0x53);
        assert_eq!(tx[1], 0b0001_0101); // open: chan0,chan2 -> 0x11, writable: chan0 -> 0x01
        assert_eq!(tx[2], 7);
        assert_eq!(tx[3], 200);
        assert_eq!(tx[4], 0);
    }

    #[test]
    fn peer_header_helpers_read_expected_bits() {
        // magic, flags (writable=chan1, open=chan0), lengths 0,3,0
        let rx: [u8; 2 + N_CHANNEL] = [0xCA, 0b0001_0010, 0, 3, 0];

        assert!(!peer_ready_for_outbound(&rx, 0));
        assert!(peer_ready_for_outbound(&rx, 1));
        assert!(!peer_ready_for_outbound(&rx, 2));

        assert!(peer_enable_bit(&rx, 0));
        assert!(!peer_enable_bit(&rx, 1));
        assert!(!peer_enable_bit(&rx, 2));

        assert_eq!(peer_inbound_len(&rx, 0), 0);
        assert_eq!(peer_inbound_len(&rx, 1), 3);
        assert_eq!(peer_inbound_len(&rx, 2), 0);
    }

    #[test]
    fn peer_enable_bit_is_reachable_for_every_channel() {
        // A comparison against the literal 1 instead of a normalized bool
        // would make every channel past the first unreachable; this is the
        // regression this helper exists to prevent.
        for chan in 0..N_CHANNEL {
            let rx: [u8; 2 + N_CHANNEL] = {
                let mut rx = [0xCAu8; 2 + N_CHANNEL];
                rx[1] = 0x10 << chan;
                rx
            };
            assert!(peer_enable_bit(&rx, chan), "channel {chan} should read enabled");
        }
    }

    #[test]
    fn read_outbound_stages_bytes_and_reports_peer_close() {
        let dir = fresh_socket_dir();
        let mut channel = blank_channel(UnixListener::bind(dir.join("0")).unwrap());

        let (mut client, server) = UnixStream::pair().unwrap();
        channel.conn = Some(server);

        client.set_nonblocking(false).unwrap();
        std::io::Write::write_all(&mut client, b"abc").unwrap();
        assert!(read_outbound(&mut channel).unwrap());
        assert_eq!(channel.out_len, 3);
        assert_eq!(&channel.out_buf[..3], b"abc");

        drop(client);
        assert!(!read_outbound(&mut channel).unwrap());
    }

    #[test]
    fn close_connection_clears_staging_but_not_enabled() {
        let dir = fresh_socket_dir();
        let mut channel = blank_channel(UnixListener::bind(dir.join("0")).unwrap());
        let (_client, server) = UnixStream::pair().unwrap();
        channel.conn = Some(server);
        channel.out_len = 10;
        channel.writable = true;
        channel.open = true;
        channel.enabled = true;

        channel.close_connection(0);

        assert!(channel.conn.is_none());
        assert_eq!(channel.out_len, 0);
        assert!(!channel.writable);
        assert!(!channel.open);
        assert!(channel.enabled);
    }

    #[test]
    fn bind_backlog_1_accepts_a_connecting_client() {
        let dir = fresh_socket_dir();
        let path = dir.join("0");
        let listener = bind_unix_listener_backlog_1(&path).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        let (server, _addr) = listener.accept().unwrap();
        drop(client);
        drop(server);
    }
}
