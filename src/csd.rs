use bitfield::bitfield;

/// Raw Card Specific Data block, read with CMD9.
pub type CsdBytes = [u8; 16];

bitfield! {
    /// Card Specific Data, version 1.0 layout (standard capacity).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct CsdV1(u128);
    pub u8, version, _: 127, 126;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
    pub erase_single_block_enabled, _: 46;
    pub copy_flag, _: 14;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// Card Specific Data, version 2.0 layout (high capacity).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct CsdV2(u128);
    pub u8, version, _: 127, 126;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub u32, device_size, _: 69, 48;
    pub erase_single_block_enabled, _: 46;
    pub copy_flag, _: 14;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

/// Card Specific Data, either layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

impl Csd {
    /// Select the layout from the structure version in the top two bits.
    pub fn from_bytes(raw: CsdBytes) -> Self {
        let value = u128::from_be_bytes(raw);
        match raw[0] >> 6 {
            0 => Csd::V1(CsdV1(value)),
            _ => Csd::V2(CsdV2(value)),
        }
    }

    /// CSD structure version: 1 or 2.
    pub fn version(&self) -> u8 {
        match self {
            Csd::V1(_) => 1,
            Csd::V2(_) => 2,
        }
    }

    /// Maximum read data block length in bytes (`1 << READ_BL_LEN`).
    pub fn read_block_length(&self) -> u32 {
        let exponent = match self {
            Csd::V1(csd) => csd.read_block_length(),
            Csd::V2(csd) => csd.read_block_length(),
        };
        1 << exponent
    }

    /// Number of blocks on the device, in native read-block units.
    pub fn block_count(&self) -> u32 {
        match self {
            Csd::V1(csd) => {
                let c_size = u32::from(csd.device_size());
                (c_size + 1) << (csd.device_size_multiplier() + 2)
            }
            Csd::V2(csd) => (csd.device_size() + 1) * 1024,
        }
    }

    /// Card capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.block_count()) * u64::from(self.read_block_length())
    }

    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }

    /// Permanent or temporary write protection is in effect.
    pub fn write_protected(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
            Csd::V2(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
        }
    }
}
