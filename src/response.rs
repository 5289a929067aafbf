use bitfield::bitfield;

bitfield! {
    /// R1 status byte returned for every command in SPI mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct R1(u8);
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
}

impl R1 {
    /// Sentinel kept by the driver before the first reply of a command.
    pub const BUSY: u8 = 0x80;
    /// Sentinel for "no response arrived within the command timeout".
    pub const NO_RESPONSE: u8 = 0xFF;

    pub fn raw(self) -> u8 {
        self.0
    }

    /// A response byte has the top bit clear.
    pub fn valid(self) -> bool {
        self.0 & 0x80 == 0
    }

    /// Initialization finished, no errors.
    pub fn ready(self) -> bool {
        self.0 == 0x00
    }

    /// In idle state and nothing else set.
    pub fn idle(self) -> bool {
        self.0 == 0x01
    }

    pub fn busy(self) -> bool {
        self.0 == Self::BUSY
    }

    pub fn no_response(self) -> bool {
        self.0 == Self::NO_RESPONSE
    }

    /// No error bits set; idle is still permitted.
    pub fn no_errors(self) -> bool {
        self.0 & 0xFC == 0
    }
}

impl Default for R1 {
    fn default() -> Self {
        R1(Self::BUSY)
    }
}
