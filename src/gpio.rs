//! GPIO sysfs line driver: export, direction, edge configuration, and the
//! per-cycle runtime operations (ack an edge, drive a level). The runtime
//! operations are exposed as traits so the transaction loop can be tested
//! against an in-memory fake without real sysfs GPIO files.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
};

use crate::error::BridgeError;

fn gpio_path(gpio: &str, file: &str) -> PathBuf {
    PathBuf::from(format!("/sys/class/gpio/gpio{gpio}/{file}"))
}

/// Exports `gpio` via `/sys/class/gpio/export` if it isn't already.
pub fn export(gpio: &str) -> Result<(), BridgeError> {
    if fs::metadata(format!("/sys/class/gpio/gpio{gpio}")).is_ok() {
        return Ok(());
    }

    let mut f = OpenOptions::new()
        .write(true)
        .open("/sys/class/gpio/export")
        .map_err(|source| BridgeError::GpioExport { gpio: gpio.to_owned(), source })?;
    f.write_all(gpio.as_bytes())
        .map_err(|source| BridgeError::GpioExport { gpio: gpio.to_owned(), source })
}

fn write_attr(gpio: &str, attr: &'static str, value: &str) -> Result<(), BridgeError> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(gpio_path(gpio, attr))
        .map_err(|source| BridgeError::GpioOpen { gpio: gpio.to_owned(), file: attr, source })?;
    f.write_all(value.as_bytes())
        .map_err(|source| BridgeError::GpioWrite { gpio: gpio.to_owned(), file: attr, source })
}

/// Sets the GPIO's `direction` attribute (e.g. `"in"`, `"out"`, `"high"`).
pub fn set_direction(gpio: &str, mode: &str) -> Result<(), BridgeError> {
    write_attr(gpio, "direction", mode)
}

/// Sets the GPIO's `edge` attribute (e.g. `"rising"`, `"none"`).
pub fn set_edge(gpio: &str, mode: &str) -> Result<(), BridgeError> {
    write_attr(gpio, "edge", mode)
}

/// Opens the GPIO's `value` file read/write, for both polling and driving.
pub fn open_value(gpio: &str) -> Result<File, BridgeError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(gpio_path(gpio, "value"))
        .map_err(|source| BridgeError::GpioOpen { gpio: gpio.to_owned(), file: "value", source })
}

/// The peer-driven IRQ input: a rising edge on `value` is the peer's request
/// for a service cycle, acknowledged by seeking to 0 and reading it again.
pub trait IrqLine {
    /// Raw fd to register `POLLPRI` interest on in the poll set.
    fn raw_fd(&self) -> RawFd;

    /// Seeks to offset 0 and reads the edge-triggered value file, clearing
    /// the pending edge condition. Called whenever the poll set reports the
    /// IRQ fd as priority-readable.
    fn ack(&mut self) -> io::Result<()>;
}

/// The host-driven sync output that frames each cycle's SPI conversation.
pub trait SyncLine {
    fn set_low(&mut self) -> io::Result<()>;
    fn set_high(&mut self) -> io::Result<()>;
}

pub struct SysfsIrq {
    file: File,
}

impl SysfsIrq {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl IrqLine for SysfsIrq {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ack(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 2];
        self.file.read(&mut buf)?;
        Ok(())
    }
}

pub struct SysfsSync {
    file: File,
}

impl SysfsSync {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    fn write_level(&mut self, level: u8) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&[level])
    }
}

impl SyncLine for SysfsSync {
    fn set_low(&mut self) -> io::Result<()> {
        self.write_level(b'0')
    }

    fn set_high(&mut self) -> io::Result<()> {
        self.write_level(b'1')
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::{io, os::fd::RawFd};

    use super::{IrqLine, SyncLine};

    /// In-memory `IrqLine`/`SyncLine` doubles for unit tests.
    ///
    /// `raw_fd` returns a fd to `/dev/null` so a real `PollSet` can still be
    /// constructed; tests drive readiness directly via
    /// `PollSet::set_revents_for_test` rather than relying on a real edge
    /// trigger on that fd.
    pub struct FakeIrq {
        fd: RawFd,
        pub ack_count: u32,
    }

    impl FakeIrq {
        pub fn new() -> Self {
            let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) };
            Self { fd, ack_count: 0 }
        }
    }

    impl Drop for FakeIrq {
        fn drop(&mut self) {
            if self.fd >= 0 {
                unsafe {
                    libc::close(self.fd);
                }
            }
        }
    }

    impl IrqLine for FakeIrq {
        fn raw_fd(&self) -> RawFd {
            self.fd
        }

        fn ack(&mut self) -> io::Result<()> {
            self.ack_count += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeSync {
        pub levels: Vec<bool>,
    }

    impl SyncLine for FakeSync {
        fn set_low(&mut self) -> io::Result<()> {
            self.levels.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> io::Result<()> {
            self.levels.push(true);
            Ok(())
        }
    }
}
