//! SD/SDHC memory card block driver for the SPI bus, inspired by
//! [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate initializes SD cards in SPI mode, discovers the card
//! generation (SD v1 / SD v2 / SDHC), and reads and writes 512-byte
//! blocks, single or multiple at a time. The SPI bus, chip select, and
//! time source are injected: any [`embedded_hal::blocking::spi::Transfer`]
//! plus [`switch_hal::OutputSwitch`] pair works as the transport, and any
//! monotonic millisecond counter works as the [`Clock`].
//!
//! Logging goes through either the `log` facade (default feature) or
//! `defmt` (`defmt-log` feature). Enable exactly one of the two.

#![cfg_attr(not(test), no_std)]

mod cid;
mod clock;
mod config;
mod consts;
mod crc;
mod csd;
mod ocr;
mod response;

pub use crate::cid::Cid;
pub use crate::clock::Clock;
pub use crate::config::SpiCardConfig;
pub use crate::consts::BLOCK_SIZE;
pub use crate::csd::{Csd, CsdBytes, CsdV1, CsdV2};
pub use crate::ocr::Ocr;
pub use crate::response::R1;

use crate::{
    consts::{commands, tokens},
    crc::{crc16, crc7},
};

use core::cell::RefCell;
use embedded_hal::blocking::spi::Transfer;
use spin::relax::{RelaxStrategy, Spin};
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};
#[cfg(feature = "log")]
use log::{debug, trace, warn};

/// Bound on the bus-release poll while aborting a stuck multi-block write.
const STUCK_WRITE_TIMEOUT_MS: u32 = 520;

/// Logical block address; one unit is 512 bytes.
pub type Lba = u32;

/// [`SpiCard`] error.
///
/// `T` - transport error type.
/// `S` - select switch error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't change the chip select.
    Select(S),
    /// Block or register I/O before a successful `begin`.
    NotInitialized,
    /// Buffer length is zero or not a multiple of the block size.
    InvalidBuffer,
    /// CMD0 never produced the idle state.
    Cmd0Failed,
    /// Voltage check pattern mismatched or went unanswered.
    Cmd8Failed,
    /// Operating-condition negotiation never reached ready.
    Acmd41Failed,
    /// OCR unreadable while classifying card capacity.
    Cmd58Failed,
    /// Block length could not be set on a standard-capacity card.
    Cmd16Failed,
    /// Failed to enable CRC checking on the card.
    CantEnableCrc,
    /// A command answered with a non-ready R1; carries the command
    /// index and the raw R1 byte for bit inspection.
    CommandError { cmd: u8, r1: u8 },
    /// CID, CSD, or OCR was not delivered.
    RegisterRead,
    /// A data block could not be read.
    Read(ReadError),
    /// A data block could not be written.
    Write(WriteError),
}

/// Classification of a failed block read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ReadError {
    /// No data token arrived in time.
    Timeout,
    /// Internal card controller error.
    CcError,
    /// Card ECC failed to correct the data.
    EccFailed,
    /// Address out of range.
    OutOfRange,
    /// Card is locked.
    CardLocked,
    /// A byte that is neither a start token nor a known error token.
    BadToken(u8),
    /// CRC16 mismatch between the card's trailer and the received data.
    Crc { card: u16, host: u16 },
}

impl ReadError {
    /// Classify a data-error token by its low nibble.
    fn from_token(token: u8) -> Self {
        if token & 0x02 != 0 {
            ReadError::CcError
        } else if token & 0x04 != 0 {
            ReadError::EccFailed
        } else if token & 0x08 != 0 {
            ReadError::OutOfRange
        } else if token & 0x10 != 0 {
            ReadError::CardLocked
        } else {
            ReadError::BadToken(token)
        }
    }
}

/// Classification of a failed block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum WriteError {
    /// Card rejected the block over its CRC.
    CrcRejected,
    /// Card reported a write error for the block.
    WriteRejected,
    /// Card stayed busy past the write timeout.
    BusyTimeout,
    /// CMD13 verification reported a non-zero status.
    Status(u8),
}

/// Card generation and capacity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    /// Not initialized yet.
    Unknown,
    /// Standard capacity, generation 1.
    SD1,
    /// Standard capacity, generation 2.
    SD2,
    /// High capacity; block-addressed on the wire.
    SDHC,
}

impl CardType {
    fn name(self) -> &'static str {
        match self {
            CardType::Unknown => "unknown",
            CardType::SD1 => "SD1",
            CardType::SD2 => "SD2",
            CardType::SDHC => "SDHC",
        }
    }
}

/// Error type alias.
type DriverError<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Build the 6-byte command frame: start byte, big-endian argument, CRC.
///
/// With CRC enabled the tail is the computed CRC7 plus the end bit; with
/// it disabled, the canonical constants for CMD0/CMD8 and a padding byte
/// (end bit still set) elsewhere.
fn build_frame(cmd: u8, arg: u32, use_crc: bool) -> [u8; 6] {
    let mut frame = [
        cmd,
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        0,
    ];
    frame[5] = if use_crc {
        (crc7(&frame[..5]) << 1) | 0x01
    } else {
        match cmd {
            commands::CMD0 => 0x95,
            commands::CMD8 => 0x87,
            _ => 0xFF,
        }
    };
    frame
}

/// SD card SPI driver.
///
/// `Spi` - SPI bus.
/// `Cs` - chip select output switch.
/// `Clk` - monotonic millisecond clock.
pub struct SpiCard<Spi: Transfer<u8>, Cs: OutputSwitch, Clk: Clock> {
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    clock: Clk,
    config: SpiCardConfig,
    card_type: CardType,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clk: Clock> SpiCard<Spi, Cs, Clk> {
    /// Fill level clocked out to give the card time to settle.
    const FILL: u8 = 0xFF;

    /// Creates a new [`SpiCard`] with the default policy values.
    pub fn new(spi: Spi, cs: Cs, clock: Clk) -> Self {
        Self::with_config(spi, cs, clock, SpiCardConfig::default())
    }

    /// Creates a new [`SpiCard`] with explicit policy values.
    pub fn with_config(spi: Spi, cs: Cs, clock: Clk, config: SpiCardConfig) -> Self {
        SpiCard {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            clock,
            config,
            card_type: CardType::Unknown,
        }
    }

    /// Card generation discovered by [`begin`](Self::begin).
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn config(&self) -> &SpiCardConfig {
        &self.config
    }

    /// Consume the driver and hand the transport back.
    pub fn release(self) -> (Spi, Cs) {
        (self.spi.into_inner(), self.cs.into_inner())
    }

    // ---- transport helpers ----

    fn select(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.cs.borrow_mut().on().map_err(Error::Select)
    }

    fn deselect(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.cs.borrow_mut().off().map_err(Error::Select)
    }

    /// Run `f` with the card selected; the deselect happens even when
    /// `f` fails.
    fn with_selection<R, F>(&self, f: F) -> Result<R, DriverError<Spi, Cs>>
    where
        F: FnOnce(&Self) -> Result<R, DriverError<Spi, Cs>>,
    {
        self.select()?;
        let result = f(self);
        self.deselect()?;
        result
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, DriverError<Spi, Cs>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the card by clocking out a fill byte.
    fn receive(&self) -> Result<u8, DriverError<Spi, Cs>> {
        self.transfer(Self::FILL)
    }

    /// Send a byte to the card.
    fn send(&self, data: u8) -> Result<(), DriverError<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    fn receive_slice(&self, data: &mut [u8]) -> Result<(), DriverError<Spi, Cs>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }
        Ok(())
    }

    fn send_slice(&self, data: &[u8]) -> Result<(), DriverError<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }
        Ok(())
    }

    fn skip_byte(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.receive().map(|_| ())
    }

    /// Clock out `count` fill bytes; many cards need these between
    /// selection cycles to settle.
    fn fill(&self, count: usize) -> Result<(), DriverError<Spi, Cs>> {
        for _ in 0..count {
            self.send(Self::FILL)?;
        }
        Ok(())
    }

    /// Poll until the card releases the bus. Returns false on timeout.
    fn wait_not_busy(&self, timeout_ms: u32) -> Result<bool, DriverError<Spi, Cs>> {
        let t0 = self.clock.now_ms();
        loop {
            if self.receive()? == tokens::AVAILABLE {
                return Ok(true);
            }
            if self.clock.elapsed(t0, timeout_ms) {
                return Ok(false);
            }
            Spin::relax();
        }
    }

    /// Poll for the first byte that is not the fill level; `0xFF` comes
    /// back on timeout.
    fn wait_response(&self, timeout_ms: u32) -> Result<u8, DriverError<Spi, Cs>> {
        let t0 = self.clock.now_ms();
        loop {
            let byte = self.receive()?;
            if byte != tokens::AVAILABLE {
                return Ok(byte);
            }
            if self.clock.elapsed(t0, timeout_ms) {
                return Ok(tokens::AVAILABLE);
            }
            Spin::relax();
        }
    }

    // ---- command engine ----

    fn command_impl(&self, cmd: u8, arg: u32) -> Result<R1, DriverError<Spi, Cs>> {
        // Everything but CMD0 waits out a busy card first. A timeout
        // here is only an observation; the command is still attempted.
        if cmd != commands::CMD0 && !self.wait_not_busy(self.config.cmd_timeout_ms)? {
            debug!("card busy ahead of CMD{}", commands::index(cmd));
        }

        self.send_slice(&build_frame(cmd, arg, self.config.use_crc))?;

        // CMD12 pushes a stuff byte out before its response.
        if cmd == commands::CMD12 {
            self.skip_byte()?;
        }

        // R1 holds the busy sentinel until the first reply byte arrives.
        let mut r1 = R1::default();
        let t0 = self.clock.now_ms();
        loop {
            let byte = self.receive()?;
            if byte != tokens::AVAILABLE {
                r1 = R1(byte);
            }
            if r1.valid() {
                return Ok(r1);
            }
            if self.clock.elapsed(t0, self.config.cmd_timeout_ms) {
                debug!("CMD{} unanswered", commands::index(cmd));
                return Ok(R1(R1::NO_RESPONSE));
            }
            Spin::relax();
        }
    }

    /// Send a command and return its R1. ACMDs are escaped with CMD55 on
    /// the same selection.
    fn command(&self, cmd: u8, arg: u32) -> Result<R1, DriverError<Spi, Cs>> {
        if cmd & commands::ACMD_FLAG != 0 {
            let r1 = self.command_impl(commands::CMD55, 0)?;
            if r1.no_response() {
                return Ok(r1);
            }
        }
        self.command_impl(cmd & !commands::ACMD_FLAG, arg)
    }

    // ---- initialization ----

    /// Initialize the card: reset to idle, probe the generation, start
    /// it up, and leave it block-addressed with 512-byte blocks.
    /// Idempotent; calling again re-runs the full sequence.
    pub fn begin(&mut self) -> Result<(), DriverError<Spi, Cs>> {
        self.card_type = CardType::Unknown;

        // At least 74 clocks with CS deasserted put the card in SPI mode.
        self.deselect()?;
        self.fill(10)?;

        self.reset_idle()?;
        if self.config.use_crc {
            self.enable_crc()?;
        }

        let mut card_type = self.probe_version()?;
        self.negotiate_ready(card_type)?;

        if card_type == CardType::SD2 {
            let ocr = self.read_ocr().map_err(|err| match err {
                Error::RegisterRead => Error::Cmd58Failed,
                other => other,
            })?;
            if ocr.high_capacity() {
                card_type = CardType::SDHC;
            }
        }

        // SDHC cards are inherently 512-byte addressed.
        if card_type != CardType::SDHC {
            self.set_block_size()?;
        }

        self.card_type = card_type;
        debug!("card initialized: {}", card_type.name());
        Ok(())
    }

    /// CMD0 until the card reports idle. A card stuck mid multi-block
    /// write (host reset, card not) eats CMD0 as data, so every failed
    /// attempt is followed by an abort of any such write.
    fn reset_idle(&self) -> Result<(), DriverError<Spi, Cs>> {
        for attempt in 0..self.config.cmd0_retry {
            trace!("CMD0 attempt {}", attempt + 1);

            self.fill(4)?;
            let r1 = self.with_selection(|s| s.command(commands::CMD0, 0))?;
            self.fill(2)?;

            if r1.idle() {
                return Ok(());
            }
            warn!("CMD0 answered {:x}", r1.raw());

            self.fill(1)?;
            self.with_selection(|s| s.abort_stuck_write())?;
            self.fill(2)?;
        }
        Err(Error::Cmd0Failed)
    }

    /// Terminate a multi-block write left over from a previous run and
    /// wait for the card to release the bus.
    fn abort_stuck_write(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.send(tokens::STOP_TRAN)?;
        let _ = self.wait_not_busy(STUCK_WRITE_TIMEOUT_MS)?;
        Ok(())
    }

    /// CMD59. The card powers up with CRC checking off in SPI mode.
    fn enable_crc(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.fill(4)?;
        let r1 = self.with_selection(|s| s.command(commands::CMD59, 1))?;
        self.fill(2)?;
        if r1.no_errors() {
            Ok(())
        } else {
            warn!("CMD59 answered {:x}", r1.raw());
            Err(Error::CantEnableCrc)
        }
    }

    /// CMD8 voltage check. Cards that reject the command predate it
    /// (SD v1); anything else must echo the check pattern back.
    fn probe_version(&self) -> Result<CardType, DriverError<Spi, Cs>> {
        self.fill(4)?;
        let result = self.with_selection(|s| {
            let r1 = s.command(commands::CMD8, 0x1AA)?;
            if r1.no_response() {
                return Err(Error::Cmd8Failed);
            }
            if r1.illegal_command() {
                return Ok(CardType::SD1);
            }
            let mut tail = [0u8; 4];
            s.receive_slice(&mut tail)?;
            if tail[3] == tokens::CMD8_PATTERN {
                Ok(CardType::SD2)
            } else {
                warn!("CMD8 echoed {:x}", tail[3]);
                Err(Error::Cmd8Failed)
            }
        });
        self.fill(2)?;
        let card_type = result?;
        trace!("CMD8 classified the card as {}", card_type.name());
        Ok(card_type)
    }

    /// ACMD41 until the card leaves idle, announcing SDHC support to
    /// v2 cards. Bounded by the init timeout.
    fn negotiate_ready(&self, card_type: CardType) -> Result<(), DriverError<Spi, Cs>> {
        let arg = if card_type == CardType::SD1 {
            0
        } else {
            0x4000_0000
        };

        let t0 = self.clock.now_ms();
        loop {
            let r1 = self.with_selection(|s| s.command(commands::ACMD41, arg))?;
            self.fill(2)?;

            if r1.ready() {
                return Ok(());
            }
            if r1.no_response() || self.clock.elapsed(t0, self.config.init_timeout_ms) {
                warn!("ACMD41 stalled at {:x}", r1.raw());
                return Err(Error::Acmd41Failed);
            }
            Spin::relax();
        }
    }

    /// CMD16, explicit 512-byte blocks for standard-capacity cards.
    fn set_block_size(&self) -> Result<(), DriverError<Spi, Cs>> {
        self.fill(2)?;
        let r1 = self.with_selection(|s| s.command(commands::CMD16, BLOCK_SIZE as u32))?;
        self.fill(2)?;
        if r1.no_errors() {
            Ok(())
        } else {
            Err(Error::Cmd16Failed)
        }
    }

    // ---- register reads ----

    /// Read the Card IDentification register.
    pub fn read_cid(&self) -> Result<Cid, DriverError<Spi, Cs>> {
        self.ensure_initialized()?;
        let mut raw = [0u8; 16];
        self.read_register(commands::CMD10, &mut raw)?;
        Ok(Cid::from(raw))
    }

    /// Read and decode the Card Specific Data register.
    pub fn read_csd(&self) -> Result<Csd, DriverError<Spi, Cs>> {
        self.ensure_initialized()?;
        let mut raw = [0u8; 16];
        self.read_register(commands::CMD9, &mut raw)?;
        Ok(Csd::from_bytes(raw))
    }

    /// Read the Operating Conditions Register. Usable before `begin`
    /// completes; initialization itself consults it.
    pub fn read_ocr(&self) -> Result<Ocr, DriverError<Spi, Cs>> {
        let ocr = self.with_selection(|s| {
            let r1 = s.command(commands::CMD58, 0)?;
            if !r1.ready() {
                warn!("CMD58 answered {:x}", r1.raw());
                return Err(Error::RegisterRead);
            }
            let mut raw = [0u8; 4];
            s.receive_slice(&mut raw)?;
            Ok(Ocr::from_bytes(raw))
        });
        self.fill(2)?;
        ocr
    }

    /// Card capacity in 512-byte blocks, from the CSD.
    pub fn capacity_blocks(&self) -> Result<u32, DriverError<Spi, Cs>> {
        let csd = self.read_csd()?;
        Ok((csd.capacity_bytes() / BLOCK_SIZE as u64) as u32)
    }

    /// 16-byte register read: command, start token, payload, discarded CRC.
    fn read_register(&self, cmd: u8, buf: &mut [u8; 16]) -> Result<(), DriverError<Spi, Cs>> {
        let result = self.with_selection(|s| {
            let r1 = s.command(cmd, 0)?;
            if !r1.no_errors() {
                warn!("CMD{} answered {:x}", commands::index(cmd), r1.raw());
                return Err(Error::RegisterRead);
            }
            let token = s.wait_response(s.config.cmd_timeout_ms)?;
            if token != tokens::DATA_START_BLOCK {
                warn!("CMD{} produced token {:x}", commands::index(cmd), token);
                return Err(Error::RegisterRead);
            }
            s.receive_slice(buf)?;
            s.skip_byte()?;
            s.skip_byte()?;
            Ok(())
        });
        self.fill(2)?;
        result
    }

    // ---- block I/O ----

    /// Read one 512-byte block into `buf`.
    pub fn read_block(&self, lba: Lba, buf: &mut [u8]) -> Result<(), DriverError<Spi, Cs>> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::InvalidBuffer);
        }
        self.read_blocks(lba, buf).map(|_| ())
    }

    /// Read `buf.len() / 512` blocks starting at `lba`.
    ///
    /// Returns the number of blocks delivered intact. A block failing
    /// mid-sequence terminates the transfer; the error itself is
    /// returned only when not even the first block arrived.
    pub fn read_blocks(&self, lba: Lba, buf: &mut [u8]) -> Result<usize, DriverError<Spi, Cs>> {
        self.ensure_initialized()?;
        let count = Self::block_count_of(buf.len())?;
        let addr = self.block_address(lba);
        let read_cmd = if count > 1 {
            commands::CMD18
        } else {
            commands::CMD17
        };
        trace!("reading {} blocks from lba {:x}", count, lba);

        self.fill(1)?;
        let result = self.with_selection(|s| {
            let r1 = s.command(read_cmd, addr)?;
            if !r1.ready() {
                return Err(Error::CommandError {
                    cmd: commands::index(read_cmd),
                    r1: r1.raw(),
                });
            }

            let mut delivered = 0;
            let mut fault = None;
            for chunk in buf.chunks_mut(BLOCK_SIZE) {
                match s.read_data(chunk, s.config.read_timeout_ms) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        fault = Some(err);
                        break;
                    }
                }
            }

            if count > 1 {
                let r1 = s.command(commands::CMD12, 0)?;
                if !r1.ready() {
                    warn!("CMD12 answered {:x}", r1.raw());
                }
            }

            match fault {
                Some(err) if delivered == 0 => Err(err),
                Some(_) => {
                    warn!("read stopped after {} of {} blocks", delivered, count);
                    Ok(delivered)
                }
                None => Ok(delivered),
            }
        });
        self.fill(2)?;
        result
    }

    /// Write one 512-byte block from `src`.
    pub fn write_block(&self, lba: Lba, src: &[u8]) -> Result<(), DriverError<Spi, Cs>> {
        if src.len() != BLOCK_SIZE {
            return Err(Error::InvalidBuffer);
        }
        self.write_blocks(lba, src).map(|_| ())
    }

    /// Write `src.len() / 512` blocks starting at `lba`.
    ///
    /// Returns the number of blocks the card accepted. Like
    /// [`read_blocks`](Self::read_blocks), a rejected block terminates
    /// the sequence and partial progress is reported as a count; a busy
    /// timeout is always an error because the card state is unknown.
    pub fn write_blocks(&self, lba: Lba, src: &[u8]) -> Result<usize, DriverError<Spi, Cs>> {
        self.ensure_initialized()?;
        let count = Self::block_count_of(src.len())?;
        let addr = self.block_address(lba);
        trace!("writing {} blocks at lba {:x}", count, lba);

        self.fill(1)?;
        let result = self.with_selection(|s| {
            let token = if count > 1 {
                // Pre-erase hint speeds up contiguous multi-block writes.
                let r1 = s.command(commands::ACMD23, count as u32)?;
                if !r1.ready() {
                    return Err(Error::CommandError {
                        cmd: commands::index(commands::ACMD23),
                        r1: r1.raw(),
                    });
                }
                let r1 = s.command(commands::CMD25, addr)?;
                if !r1.ready() {
                    return Err(Error::CommandError {
                        cmd: commands::index(commands::CMD25),
                        r1: r1.raw(),
                    });
                }
                tokens::WRITE_MULTIPLE
            } else {
                let r1 = s.command(commands::CMD24, addr)?;
                if !r1.ready() {
                    return Err(Error::CommandError {
                        cmd: commands::index(commands::CMD24),
                        r1: r1.raw(),
                    });
                }
                tokens::DATA_START_BLOCK
            };
            s.fill(1)?;

            let mut written = 0;
            let mut fault = None;
            for chunk in src.chunks(BLOCK_SIZE) {
                match s.write_data(token, chunk) {
                    Ok(()) => {
                        if !s.wait_not_busy(s.config.write_timeout_ms)? {
                            warn!("card stuck busy after block {}", written);
                            return Err(Error::Write(WriteError::BusyTimeout));
                        }
                        written += 1;
                    }
                    Err(err) => {
                        fault = Some(err);
                        break;
                    }
                }
            }

            if count > 1 {
                // Stop even a faulted sequence so the card leaves
                // receive state.
                if !s.wait_not_busy(s.config.write_timeout_ms)? {
                    return Err(Error::Write(WriteError::BusyTimeout));
                }
                s.send(tokens::STOP_TRAN)?;
                s.skip_byte()?;
                if !s.wait_not_busy(s.config.write_timeout_ms)? {
                    return Err(Error::Write(WriteError::BusyTimeout));
                }
            }

            match fault {
                Some(err) if written == 0 => Err(err),
                Some(_) => {
                    warn!("write stopped after {} of {} blocks", written, count);
                    Ok(written)
                }
                None => Ok(written),
            }
        });
        self.fill(2)?;

        let written = result?;
        if self.config.verify_writes && written > 0 {
            self.check_write_status()?;
        }
        Ok(written)
    }

    /// Await a data token and read one block, verifying the CRC trailer
    /// when CRC mode is on.
    fn read_data(&self, buf: &mut [u8], timeout_ms: u32) -> Result<(), DriverError<Spi, Cs>> {
        let token = self.wait_response(timeout_ms)?;
        if token == tokens::AVAILABLE {
            warn!("timed out waiting for a data token");
            return Err(Error::Read(ReadError::Timeout));
        }
        if token != tokens::DATA_START_BLOCK {
            warn!("data error token {:x}", token);
            return Err(Error::Read(ReadError::from_token(token)));
        }

        self.receive_slice(buf)?;
        let card_crc = (u16::from(self.receive()?) << 8) | u16::from(self.receive()?);
        if self.config.use_crc {
            let host_crc = crc16(buf);
            if card_crc != host_crc {
                warn!("block CRC mismatch: card {:x}, host {:x}", card_crc, host_crc);
                return Err(Error::Read(ReadError::Crc {
                    card: card_crc,
                    host: host_crc,
                }));
            }
        }
        Ok(())
    }

    /// Send one block behind `token` and classify the data response.
    fn write_data(&self, token: u8, data: &[u8]) -> Result<(), DriverError<Spi, Cs>> {
        let crc = crc16(data);
        self.send(token)?;
        self.send_slice(data)?;
        self.send((crc >> 8) as u8)?;
        self.send(crc as u8)?;

        let status = self.receive()? & tokens::DATA_RES_MASK;
        match status {
            tokens::DATA_RES_ACCEPTED => Ok(()),
            tokens::DATA_RES_CRC_ERROR => Err(Error::Write(WriteError::CrcRejected)),
            tokens::DATA_RES_WRITE_ERROR => Err(Error::Write(WriteError::WriteRejected)),
            _ => {
                warn!("unrecognized data response {:x}", status);
                Err(Error::Write(WriteError::WriteRejected))
            }
        }
    }

    /// CMD13 after a write sequence; any status bit is a failure.
    fn check_write_status(&self) -> Result<(), DriverError<Spi, Cs>> {
        let result = self.with_selection(|s| {
            let r1 = s.command(commands::CMD13, 0)?;
            let status = s.receive()?;
            if r1.ready() && status == 0 {
                Ok(())
            } else {
                warn!("post-write status {:x} {:x}", r1.raw(), status);
                Err(Error::Write(WriteError::Status(status)))
            }
        });
        self.fill(2)?;
        result
    }

    // ---- addressing ----

    fn ensure_initialized(&self) -> Result<(), DriverError<Spi, Cs>> {
        if self.card_type == CardType::Unknown {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Standard-capacity cards are byte-addressed on the wire.
    fn block_address(&self, lba: Lba) -> u32 {
        match self.card_type {
            CardType::SDHC => lba,
            _ => lba << 9,
        }
    }

    fn block_count_of(len: usize) -> Result<usize, DriverError<Spi, Cs>> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            warn!("invalid buffer length {}", len);
            Err(Error::InvalidBuffer)
        } else {
            Ok(len / BLOCK_SIZE)
        }
    }
}
