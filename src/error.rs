use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that abort the daemon outright.
///
/// Anything recoverable at cycle granularity (a bad header reply, a client
/// read/write failure, a transient accept failure) is handled inline in
/// [`crate::transaction`] and never constructed as a `BridgeError`.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("opening SPI device {path:?}: {source}")]
    SpiOpen { path: PathBuf, source: io::Error },

    #[error("SPI_IOC_MESSAGE ioctl failed: {0}")]
    SpiIoctl(io::Error),

    #[error("exporting GPIO {gpio}: {source}")]
    GpioExport { gpio: String, source: io::Error },

    #[error("opening GPIO {gpio} file {file}: {source}")]
    GpioOpen { gpio: String, file: &'static str, source: io::Error },

    #[error("writing GPIO {gpio} {file}: {source}")]
    GpioWrite { gpio: String, file: &'static str, source: io::Error },

    #[error("reading GPIO {gpio} value: {source}")]
    GpioRead { gpio: String, source: io::Error },

    #[error("binding socket {path:?}: {source}")]
    SocketBind { path: PathBuf, source: io::Error },

    #[error("listening on socket {path:?}: {source}")]
    SocketListen { path: PathBuf, source: io::Error },

    #[error("socket directory {0:?} does not exist or is not a directory")]
    BadSocketDir(PathBuf),

    #[error("poll(2) failed: {0}")]
    Poll(io::Error),

    #[error("header magic mismatch sustained for {0} consecutive cycles, giving up")]
    SustainedMismatch(u32),
}
