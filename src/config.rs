use std::path::PathBuf;

use clap::Parser;

/// SPI/GPIO bridge daemon: multiplexes Unix-domain channels to a co-processor.
#[derive(Debug, Parser)]
#[command(name = "chanbridge", version, about)]
pub struct Args {
    /// Path to the SPI character device, e.g. /dev/spidev0.1
    pub spi_device: PathBuf,

    /// IRQ GPIO identifier, as used in the kernel's GPIO sysfs numbering
    pub irq_gpio: String,

    /// Sync GPIO identifier, as used in the kernel's GPIO sysfs numbering
    pub sync_gpio: String,

    /// Directory under which channel sockets are bound as <dir>/0, <dir>/1, ...
    pub socket_dir: PathBuf,
}
