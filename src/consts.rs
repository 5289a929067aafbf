/// Logical block size exposed to callers, in bytes.
pub const BLOCK_SIZE: usize = 512;

pub mod commands {
    /// CMD base value; every frame starts with this bit pattern.
    pub const CMD_BASE: u8 = 0x40;
    /// Marker for application-specific commands (CMD55 prefix required).
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - reset the card into SPI mode if CS is low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// SEND_CID - read the card identification information (CID register).
    pub const CMD10: u8 = CMD_BASE + 10;
    /// STOP_TRANSMISSION - end a multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = CMD_BASE + 13;
    /// SET_BLOCKLEN - set the block size on standard-capacity cards.
    pub const CMD16: u8 = CMD_BASE + 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK - read data blocks until a STOP_TRANSMISSION.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a stop token.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// APP_CMD - escape for application specific commands.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// CRC_ON_OFF - enable or disable CRC checking.
    pub const CMD59: u8 = CMD_BASE + 59;
    /// SET_WR_BLK_ERASE_COUNT - pre-erase hint before a multi-block write.
    pub const ACMD23: u8 = CMD_BASE + ACMD_FLAG + 23;
    /// SD_SEND_OP_COND - send host capacity support and start initialization.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// 6-bit command index as it appears on the wire, for diagnostics.
    pub const fn index(cmd: u8) -> u8 {
        cmd & !(CMD_BASE | ACMD_FLAG)
    }
}

pub mod tokens {
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Write data rejected, CRC mismatch.
    pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
    /// Write data rejected, device write error.
    pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;
    /// Released bus level; the card holds MISO low while busy.
    pub const AVAILABLE: u8 = 0xFF;
    /// Check pattern echoed back in the CMD8 (R7) tail.
    pub const CMD8_PATTERN: u8 = 0xAA;
}
