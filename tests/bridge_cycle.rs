//! Drives `TransactionLoop` end to end over real Unix-domain sockets, with
//! only the SPI bus and GPIO lines faked (the hardware unavailable in CI).

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
};

use chanbridge::{
    channel::{ChannelTable, HEADER_MAGIC_REPLY},
    gpio::fake::{FakeIrq, FakeSync},
    spi::fake::FakeSpi,
    transaction::{CycleOutcome, TransactionLoop},
};

fn enable_reply(chan: usize) -> [u8; 5] {
    let mut reply = [HEADER_MAGIC_REPLY, 0, 0, 0, 0];
    reply[1] |= 0x10 << chan;
    reply
}

#[test]
fn two_channels_carry_independent_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let channels = ChannelTable::bind_all(dir.path()).unwrap();
    let mut bridge =
        TransactionLoop::new(FakeSpi::default(), FakeIrq::new(), FakeSync::default(), channels);
    bridge.set_poll_timeout_for_test(20);

    // Peer enables channels 0 and 2 only.
    let mut reply = enable_reply(0);
    reply[1] |= 0x10 << 2;
    bridge.spi_mut().header_replies.push_back(reply);
    assert_eq!(bridge.run_cycle().unwrap(), CycleOutcome::Completed);

    let mut client0 = UnixStream::connect(dir.path().join("0")).unwrap();
    // Listen sockets are armed from startup regardless of the peer's enable
    // bit (matching the reference's unconditional `SOCK_POLL(i).events =
    // POLLIN` at setup), so channel 1 accepts a connection even though it is
    // never enabled in this test; it just never carries payload, since the
    // header exchange never negotiates a descriptor for it.
    let client1 = UnixStream::connect(dir.path().join("1"));
    let mut client2 = UnixStream::connect(dir.path().join("2")).unwrap();

    assert!(client1.is_ok());

    let mut reply = enable_reply(0);
    reply[1] |= 0x10 << 2;
    bridge.spi_mut().header_replies.push_back(reply);
    assert_eq!(bridge.run_cycle().unwrap(), CycleOutcome::Completed);

    client0.write_all(b"hello").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    // This pass observes both: channel 0's pending read and channel 2's
    // socket going writable happen in the same poll() snapshot, since both
    // connections were accepted (and so registered in the poll set) a full
    // cycle ago.
    let mut reply = enable_reply(0);
    reply[1] |= 0x10 << 2;
    reply[1] |= 0x01; // channel 0 ready for outbound
    reply[2 + 2] = 4; // 4 bytes inbound for channel 2
    bridge.spi_mut().header_replies.push_back(reply);
    bridge.spi_mut().rx_payloads.push_back(b"ping".to_vec());
    assert_eq!(bridge.run_cycle().unwrap(), CycleOutcome::Completed);

    assert!(bridge.spi_mut().tx_log.iter().any(|b| b == b"hello"));

    let mut buf = [0u8; 4];
    client2.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}
