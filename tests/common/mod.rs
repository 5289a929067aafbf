//! Test doubles for the driver: a protocol-level SD card emulator that
//! sits behind the SPI transport, a recording chip-select switch, and a
//! deterministic clock.
//!
//! The emulator parses command frames out of the MOSI stream and serves
//! R1/R3/R7 responses, register blocks, and read/write data phases, so
//! tests script card *behavior* rather than byte-exact transactions
//! (the driver's polling consumes a variable number of fill bytes).

#![allow(dead_code)]

use core::cell::Cell;
use core::convert::Infallible;
use std::collections::{BTreeMap, VecDeque};

use crc::{Crc, CRC_16_XMODEM, CRC_7_MMC};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

use sdcard_spi::{Clock, SpiCard, SpiCardConfig};

pub const BLOCK: usize = 512;

const CRC7_REF: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);
const CRC16_REF: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Card generation the emulator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// SD v1 standard capacity: rejects CMD8.
    Sd1,
    /// SD v2 standard capacity: byte addressed, CCS clear.
    Sd2Sc,
    /// SD v2 high capacity: block addressed, CCS set.
    Sdhc,
}

enum Mode {
    /// Idle or streaming queued output; command frames accepted.
    Transfer,
    /// Serving CMD17/CMD18; blocks are queued lazily as the host drains.
    Reading { next: u32, served: usize, single: bool },
    /// CMD24/CMD25 accepted; waiting for a start or stop token.
    AwaitWriteToken { multi: bool },
    /// Accumulating 512 data + 2 CRC bytes of one written block.
    CollectingBlock { multi: bool, buf: Vec<u8> },
}

pub struct VirtualCard {
    pub generation: Generation,

    // Fault injection.
    /// Answer the first N CMD0s with 0x00 instead of idle.
    pub cmd0_not_idle: usize,
    /// Answer the first N ACMD41s with idle before going ready.
    pub acmd41_busy: usize,
    /// Never answer ACMD41 at all.
    pub acmd41_mute: bool,
    /// Echo a wrong CMD8 check pattern.
    pub cmd8_bad_pattern: bool,
    /// Replace the Nth served read block with a data-error token.
    pub read_error_token_at: Option<(usize, u8)>,
    /// Corrupt the CRC trailer of the Nth served read block.
    pub corrupt_read_crc_at: Option<usize>,
    /// Answer the Nth written block of a sequence with this data response.
    pub reject_write_at: Option<(usize, u8)>,
    /// Hold the bus busy forever after accepting a block.
    pub stay_busy_after_write: bool,
    /// Second status byte of the CMD13 (R2) response.
    pub cmd13_status: u8,

    /// Every executed command as (index, argument), CMD55 included.
    pub log: Vec<(u8, u32)>,

    blocks: BTreeMap<u32, Vec<u8>>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    mode: Mode,
    acmd_pending: bool,
    initialized: bool,
    crc_checking: bool,
    busy_forever: bool,
    write_base: u32,
    written_in_seq: usize,
}

impl VirtualCard {
    pub fn new(generation: Generation) -> Self {
        VirtualCard {
            generation,
            cmd0_not_idle: 0,
            acmd41_busy: 0,
            acmd41_mute: false,
            cmd8_bad_pattern: false,
            read_error_token_at: None,
            corrupt_read_crc_at: None,
            reject_write_at: None,
            stay_busy_after_write: false,
            cmd13_status: 0,
            log: Vec::new(),
            blocks: BTreeMap::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            mode: Mode::Transfer,
            acmd_pending: false,
            initialized: false,
            crc_checking: false,
            busy_forever: false,
            write_base: 0,
            written_in_seq: 0,
        }
    }

    /// Stored content of a block, or the default ramp pattern.
    pub fn block_content(&self, index: u32) -> Vec<u8> {
        self.blocks
            .get(&index)
            .cloned()
            .unwrap_or_else(|| (0..BLOCK).map(|i| (i & 0xFF) as u8).collect())
    }

    pub fn stored_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn count_of(&self, cmd_index: u8) -> usize {
        self.log.iter().filter(|(cmd, _)| *cmd == cmd_index).count()
    }

    pub fn args_of(&self, cmd_index: u8) -> Vec<u32> {
        self.log
            .iter()
            .filter(|(cmd, _)| *cmd == cmd_index)
            .map(|(_, arg)| *arg)
            .collect()
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        match &mut self.mode {
            Mode::AwaitWriteToken { multi } => {
                let multi = *multi;
                match mosi {
                    0xFD if multi => {
                        // Stop token: one gap byte, brief programming busy.
                        self.out.extend([0xFF, 0x00, 0x00]);
                        self.mode = Mode::Transfer;
                    }
                    0xFE if !multi => {
                        self.mode = Mode::CollectingBlock {
                            multi: false,
                            buf: Vec::with_capacity(BLOCK + 2),
                        }
                    }
                    0xFC if multi => {
                        self.mode = Mode::CollectingBlock {
                            multi: true,
                            buf: Vec::with_capacity(BLOCK + 2),
                        }
                    }
                    0xFF => {}
                    other => panic!("unexpected byte {other:#04x} while awaiting a write token"),
                }
                return self.pop_out();
            }
            Mode::CollectingBlock { multi, buf } => {
                buf.push(mosi);
                if buf.len() == BLOCK + 2 {
                    let multi = *multi;
                    let buf = std::mem::take(buf);
                    self.finish_written_block(multi, buf);
                }
                return self.pop_out();
            }
            _ => {}
        }

        // Commands are accepted while idle and while streaming reads
        // (that is how CMD12 interrupts CMD18).
        if self.frame.is_empty() {
            if mosi & 0xC0 == 0x40 {
                self.frame.push(mosi);
            }
        } else {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                self.execute(&frame);
            }
        }
        self.pop_out()
    }

    fn pop_out(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.busy_forever {
            return 0x00;
        }
        if matches!(self.mode, Mode::Reading { .. }) {
            self.serve_read_block();
            if let Some(byte) = self.out.pop_front() {
                return byte;
            }
        }
        0xFF
    }

    fn execute(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let acmd = std::mem::take(&mut self.acmd_pending);

        assert_eq!(frame[5] & 0x01, 0x01, "CMD{index}: frame end bit missing");
        if self.crc_checking || index == 0 || index == 8 {
            assert_eq!(
                frame[5] >> 1,
                CRC7_REF.checksum(&frame[..5]),
                "CMD{index}: bad frame CRC"
            );
        }

        self.log.push((index, arg));

        // One pad byte eaten by the final frame exchange, one N_cr gap
        // before the response, so the host's poll loop really polls.
        self.out.extend([0xFF, 0xFF]);

        match (index, acmd) {
            (0, _) => {
                self.mode = Mode::Transfer;
                self.acmd_pending = false;
                if self.cmd0_not_idle > 0 {
                    self.cmd0_not_idle -= 1;
                    self.out.push_back(0x00);
                } else {
                    self.initialized = false;
                    self.crc_checking = false;
                    self.out.push_back(0x01);
                }
            }
            (8, _) => {
                if self.generation == Generation::Sd1 {
                    self.out.push_back(0x05);
                } else {
                    self.out.push_back(0x01);
                    let pattern = if self.cmd8_bad_pattern { 0x55 } else { 0xAA };
                    self.out.extend([0x00, 0x00, 0x01, pattern]);
                }
            }
            (59, _) => {
                self.crc_checking = arg & 1 == 1;
                self.out.push_back(self.state_r1());
            }
            (55, _) => {
                self.acmd_pending = true;
                self.out.push_back(self.state_r1());
            }
            (41, true) => {
                if self.acmd41_mute {
                    self.out.truncate(0);
                } else {
                    if self.generation == Generation::Sd1 {
                        assert_eq!(arg, 0, "v1 cards must not see the HCS bit");
                    } else {
                        assert_eq!(arg, 0x4000_0000, "v2 cards expect the HCS bit");
                    }
                    if self.acmd41_busy > 0 {
                        self.acmd41_busy -= 1;
                        self.out.push_back(0x01);
                    } else {
                        self.initialized = true;
                        self.out.push_back(0x00);
                    }
                }
            }
            (58, _) => {
                let r1 = self.state_r1();
                self.out.push_back(r1);
                if r1 == 0x00 {
                    let ccs = if self.generation == Generation::Sdhc { 0xC0 } else { 0x80 };
                    self.out.extend([ccs, 0xFF, 0x80, 0x00]);
                }
            }
            (16, _) => {
                let r1 = if arg == BLOCK as u32 { self.state_r1() } else { 0x40 };
                self.out.push_back(r1);
            }
            (9, _) => self.serve_register(self.csd_bytes()),
            (10, _) => self.serve_register(CID_SAMPLE),
            (13, _) => {
                self.out.push_back(self.state_r1());
                self.out.push_back(self.cmd13_status);
            }
            (17, _) | (18, _) => {
                assert!(self.initialized, "read before initialization");
                let next = self.data_address(arg);
                self.out.push_back(0x00);
                self.mode = Mode::Reading {
                    next,
                    served: 0,
                    single: index == 17,
                };
            }
            (12, _) => {
                self.out.clear();
                self.mode = Mode::Transfer;
                // Pad, stuff byte, R1.
                self.out.extend([0xFF, 0xFF, 0x00]);
            }
            (23, true) => {
                self.out.push_back(0x00);
            }
            (24, _) | (25, _) => {
                assert!(self.initialized, "write before initialization");
                self.write_base = self.data_address(arg);
                self.written_in_seq = 0;
                self.out.push_back(0x00);
                self.mode = Mode::AwaitWriteToken { multi: index == 25 };
            }
            _ => {
                // Unknown or mis-escaped command.
                self.out.push_back(self.state_r1() | 0x04);
            }
        }
    }

    fn state_r1(&self) -> u8 {
        if self.initialized {
            0x00
        } else {
            0x01
        }
    }

    fn data_address(&self, arg: u32) -> u32 {
        if self.generation == Generation::Sdhc {
            arg
        } else {
            assert_eq!(arg & 0x1FF, 0, "byte address must be block aligned");
            arg >> 9
        }
    }

    fn serve_register(&mut self, raw: [u8; 16]) {
        self.out.push_back(self.state_r1());
        let crc = CRC16_REF.checksum(&raw);
        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(raw);
        self.out.push_back((crc >> 8) as u8);
        self.out.push_back(crc as u8);
    }

    fn serve_read_block(&mut self) {
        let (next, served, single) = match self.mode {
            Mode::Reading { next, served, single } => (next, served, single),
            _ => unreachable!(),
        };

        if let Some((at, token)) = self.read_error_token_at {
            if served == at {
                self.out.extend([0xFF, token]);
                self.mode = Mode::Transfer;
                return;
            }
        }

        let data = self.block_content(next);
        let mut crc = CRC16_REF.checksum(&data);
        if self.corrupt_read_crc_at == Some(served) {
            crc ^= 0xFFFF;
        }

        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(data.iter().copied());
        self.out.push_back((crc >> 8) as u8);
        self.out.push_back(crc as u8);

        self.mode = if single {
            Mode::Transfer
        } else {
            Mode::Reading {
                next: next + 1,
                served: served + 1,
                single: false,
            }
        };
    }

    fn finish_written_block(&mut self, multi: bool, buf: Vec<u8>) {
        let data = &buf[..BLOCK];
        let received_crc = u16::from_be_bytes([buf[BLOCK], buf[BLOCK + 1]]);
        let expected_crc = CRC16_REF.checksum(data);

        let response = match self.reject_write_at {
            Some((at, resp)) if at == self.written_in_seq => resp,
            _ if received_crc != expected_crc => 0x0B,
            _ => {
                self.blocks
                    .insert(self.write_base + self.written_in_seq as u32, data.to_vec());
                0x05
            }
        };

        self.out.push_back(response);
        if response & 0x1F == 0x05 {
            if self.stay_busy_after_write {
                self.busy_forever = true;
            } else {
                self.out.extend([0x00, 0x00, 0x00]);
            }
        }

        self.written_in_seq += 1;
        self.mode = if multi {
            Mode::AwaitWriteToken { multi: true }
        } else {
            Mode::Transfer
        };
    }

    fn csd_bytes(&self) -> [u8; 16] {
        match self.generation {
            // 8 GiB v2 layout: C_SIZE = 0x3FFF.
            Generation::Sdhc => [
                0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3F, 0xFF, 0x7F, 0x80, 0x0A,
                0x40, 0x00, 0x8D,
            ],
            // 1 GiB v1 layout: C_SIZE = 4095, C_SIZE_MULT = 7, READ_BL_LEN = 9.
            Generation::Sd1 | Generation::Sd2Sc => {
                let value: u128 = (4095u128 << 62) | (7u128 << 47) | (9u128 << 80) | (1u128 << 46);
                value.to_be_bytes()
            }
        }
    }
}

/// CID of a SanDisk 8GB card; see the unit tests in `src/cid.rs`.
pub const CID_SAMPLE: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x11, 0x22, 0x33, 0x44, 0x01, 0x12,
    0x6B,
];

impl Transfer<u8> for VirtualCard {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        for byte in words.iter_mut() {
            *byte = self.exchange(*byte);
        }
        Ok(words)
    }
}

/// Chip select double; records that selections happened at all.
pub struct FakeCs {
    pub selected: bool,
    pub selections: usize,
}

impl FakeCs {
    pub fn new() -> Self {
        FakeCs {
            selected: false,
            selections: 0,
        }
    }
}

impl OutputSwitch for FakeCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.selected = true;
        self.selections += 1;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.selected = false;
        Ok(())
    }
}

/// Advances one millisecond per reading, so poll loops terminate
/// deterministically.
pub struct TickClock(Cell<u32>);

impl TickClock {
    pub fn new() -> Self {
        TickClock(Cell::new(0))
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u32 {
        let now = self.0.get();
        self.0.set(now.wrapping_add(1));
        now
    }
}

pub type TestCard = SpiCard<VirtualCard, FakeCs, TickClock>;

pub fn driver(card: VirtualCard) -> TestCard {
    SpiCard::new(card, FakeCs::new(), TickClock::new())
}

pub fn driver_with(card: VirtualCard, config: SpiCardConfig) -> TestCard {
    SpiCard::with_config(card, FakeCs::new(), TickClock::new(), config)
}

/// A driver that already went through `begin` against the given card
/// generation.
pub fn initialized(generation: Generation) -> TestCard {
    let mut card = driver(VirtualCard::new(generation));
    card.begin().expect("initialization failed");
    card
}
