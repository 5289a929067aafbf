/// Timeout, retry, and protocol policy values, injected at construction.
///
/// The defaults suit standard SPI bus speeds; tighten them on fast
/// transports or relax them on USB-SPI bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct SpiCardConfig {
    /// CMD0 attempts before initialization gives up.
    pub cmd0_retry: u8,
    /// Bound on command responses, register data tokens, and the busy
    /// wait ahead of a command.
    pub cmd_timeout_ms: u32,
    /// Aggregate bound on the ACMD41 operating-condition negotiation.
    pub init_timeout_ms: u32,
    /// Bound on inter-block data token waits while reading.
    pub read_timeout_ms: u32,
    /// Bound on the busy wait after each written block and after the
    /// stop token.
    pub write_timeout_ms: u32,
    /// Compute CRC7 for every command frame, enable CRC checking on the
    /// card (CMD59), and verify the CRC16 of incoming data blocks. With
    /// this off, frames carry the two canonical constants for CMD0/CMD8
    /// and a padding byte elsewhere.
    pub use_crc: bool,
    /// Issue CMD13 after each write sequence and fail on a non-zero
    /// card status.
    pub verify_writes: bool,
}

impl Default for SpiCardConfig {
    fn default() -> Self {
        SpiCardConfig {
            cmd0_retry: 10,
            cmd_timeout_ms: 300,
            init_timeout_ms: 2000,
            read_timeout_ms: 1000,
            write_timeout_ms: 2000,
            use_crc: true,
            verify_writes: false,
        }
    }
}
