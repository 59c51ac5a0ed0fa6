//! SPI transactor: vectored `ioctl(2)` transfers over a spidev character
//! device. `SpiIocTransfer` mirrors `struct spi_ioc_transfer` from
//! `linux/spi/spidev.h` field-for-field.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::Path,
};

use crate::error::BridgeError;

/// Mirrors `struct spi_ioc_transfer` (`linux/spi/spidev.h`), 32 bytes on every
/// platform the kernel runs spidev on.
#[repr(C)]
#[derive(Clone, Copy)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    pad: u16,
}

impl Default for SpiIocTransfer {
    fn default() -> Self {
        Self {
            tx_buf: 0,
            rx_buf: 0,
            len: 0,
            speed_hz: 0,
            delay_usecs: 0,
            bits_per_word: 0,
            cs_change: 0,
            tx_nbits: 0,
            rx_nbits: 0,
            pad: 0,
        }
    }
}

const SPI_IOC_MAGIC: u64 = b'k' as u64;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_WRITE: u64 = 1;
const IOC_SIZEBITS_MAX: u64 = 1 << 14;

/// Computes the `SPI_IOC_MESSAGE(n)` ioctl request number for `n` transfer
/// descriptors, exactly as the `_IOW(SPI_IOC_MAGIC, 0, char[...])` macro does.
fn spi_ioc_message(n: usize) -> libc::c_ulong {
    let raw_size = n as u64 * size_of::<SpiIocTransfer>() as u64;
    let size = if raw_size < IOC_SIZEBITS_MAX { raw_size } else { 0 };
    ((IOC_WRITE << IOC_DIRSHIFT) | (SPI_IOC_MAGIC << IOC_TYPESHIFT) | (size << IOC_SIZESHIFT))
        as libc::c_ulong
}

/// One half-duplex leg of a vectored SPI transfer: either bytes going out to
/// the peer, or a scratch buffer to receive bytes into. A single `transfer`
/// call may mix both kinds, issued as one atomic `ioctl`.
pub enum Descriptor<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

/// The vectored SPI primitive the transaction loop needs. Abstracted so the
/// loop can be tested against [`fake::FakeSpi`] without a real spidev device.
pub trait SpiBus {
    /// Issues `descriptors` as a single atomic vectored transfer.
    fn transfer(&mut self, descriptors: &mut [Descriptor<'_>]) -> io::Result<()>;
}

pub struct Spidev {
    file: File,
}

impl Spidev {
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|source| {
            BridgeError::SpiOpen { path: path.to_owned(), source }
        })?;
        Ok(Self { file })
    }
}

impl SpiBus for Spidev {
    fn transfer(&mut self, descriptors: &mut [Descriptor<'_>]) -> io::Result<()> {
        if descriptors.is_empty() {
            return Ok(());
        }

        let mut raw = vec![SpiIocTransfer::default(); descriptors.len()];
        for (slot, desc) in raw.iter_mut().zip(descriptors.iter_mut()) {
            match desc {
                Descriptor::Tx(buf) => {
                    slot.tx_buf = buf.as_ptr() as u64;
                    slot.len = buf.len() as u32;
                }
                Descriptor::Rx(buf) => {
                    slot.rx_buf = buf.as_mut_ptr() as u64;
                    slot.len = buf.len() as u32;
                }
            }
        }

        let request = spi_ioc_message(raw.len());
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, raw.as_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::{collections::VecDeque, io};

    use super::{Descriptor, SpiBus};

    /// Records every transfer issued and replays a scripted sequence of
    /// header replies; data-exchange rx descriptors are filled from a
    /// per-call scripted payload.
    #[derive(Default)]
    pub struct FakeSpi {
        pub header_replies: VecDeque<[u8; 5]>,
        pub rx_payloads: VecDeque<Vec<u8>>,
        pub tx_log: Vec<Vec<u8>>,
    }

    impl SpiBus for FakeSpi {
        fn transfer(&mut self, descriptors: &mut [Descriptor<'_>]) -> io::Result<()> {
            for desc in descriptors.iter_mut() {
                match desc {
                    Descriptor::Tx(buf) => self.tx_log.push(buf.to_vec()),
                    Descriptor::Rx(buf) => {
                        if buf.len() == 5 {
                            if let Some(reply) = self.header_replies.pop_front() {
                                buf.copy_from_slice(&reply);
                            }
                        } else if let Some(payload) = self.rx_payloads.pop_front() {
                            let n = payload.len().min(buf.len());
                            buf[..n].copy_from_slice(&payload[..n]);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_message_matches_known_magic_for_two_transfers() {
        // SPI_IOC_MESSAGE(2) on a 64-bit host: dir=write(1), type='k', size=2*32=64.
        let req = spi_ioc_message(2);
        let expected = (1u64 << 30) | (u64::from(b'k') << 8) | (64u64 << 16);
        assert_eq!(req as u64, expected);
    }

    #[test]
    fn ioc_message_is_zero_descriptors_safe() {
        let req = spi_ioc_message(0);
        let expected = (1u64 << 30) | (u64::from(b'k') << 8);
        assert_eq!(req as u64, expected);
    }

    #[test]
    fn fake_spi_logs_tx_and_replays_header() {
        use fake::FakeSpi;

        let mut spi = FakeSpi::default();
        spi.header_replies.push_back([0xCA, 0x01, 3, 0, 0]);

        let tx = [0x53u8, 0x00, 3, 0, 0];
        let mut rx = [0u8; 5];
        {
            let mut descriptors = [Descriptor::Tx(&tx), Descriptor::Rx(&mut rx)];
            spi.transfer(&mut descriptors).unwrap();
        }

        assert_eq!(spi.tx_log, vec![tx.to_vec()]);
        assert_eq!(rx, [0xCA, 0x01, 3, 0, 0]);
    }

    #[test]
    fn fake_spi_fills_data_descriptors_from_scripted_payload() {
        use fake::FakeSpi;

        let mut spi = FakeSpi::default();
        spi.rx_payloads.push_back(vec![1, 2, 3]);

        let mut buf = [0u8; 3];
        {
            let mut descriptors = [Descriptor::Rx(&mut buf)];
            spi.transfer(&mut descriptors).unwrap();
        }

        assert_eq!(buf, [1, 2, 3]);
    }
}
