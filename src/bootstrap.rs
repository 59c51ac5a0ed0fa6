//! Startup glue: GPIO sysfs export/direction/edge configuration, SPI device
//! open, and socket bind/listen bootstrap, each step kept as an
//! independently callable, fallible function.

use std::fs::File;

use tracing::info;

use crate::{
    channel::ChannelTable,
    config::Args,
    error::BridgeError,
    gpio::{self, SysfsIrq, SysfsSync},
    spi::Spidev,
};

pub struct Bootstrapped {
    pub spi: Spidev,
    pub irq: SysfsIrq,
    pub sync: SysfsSync,
    pub channels: ChannelTable,
}

/// Configures the IRQ GPIO: export, direction `in`, edge `rising`.
pub fn setup_irq_gpio(id: &str) -> Result<File, BridgeError> {
    gpio::export(id)?;
    gpio::set_direction(id, "in")?;
    gpio::set_edge(id, "rising")?;
    gpio::open_value(id)
}

/// Configures the sync GPIO: export, edge `none`, direction `high` (initial
/// level high).
pub fn setup_sync_gpio(id: &str) -> Result<File, BridgeError> {
    gpio::export(id)?;
    gpio::set_edge(id, "none")?;
    gpio::set_direction(id, "high")?;
    gpio::open_value(id)
}

pub fn run(args: &Args) -> Result<Bootstrapped, BridgeError> {
    info!(device = %args.spi_device.display(), "opening SPI device");
    let spi = Spidev::open(&args.spi_device)?;

    info!(gpio = %args.irq_gpio, "configuring IRQ GPIO");
    let irq_file = setup_irq_gpio(&args.irq_gpio)?;
    let irq = SysfsIrq::new(irq_file);

    info!(gpio = %args.sync_gpio, "configuring sync GPIO");
    let sync_file = setup_sync_gpio(&args.sync_gpio)?;
    let sync = SysfsSync::new(sync_file);

    info!(dir = %args.socket_dir.display(), "binding channel sockets");
    let channels = ChannelTable::bind_all(&args.socket_dir)?;

    Ok(Bootstrapped { spi, irq, sync, channels })
}
