use bitfield::bitfield;

bitfield! {
    /// Operating Conditions Register, read with CMD58.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct Ocr(u32);
    /// Power-up routine finished.
    pub pwr_up_status, _: 31;
    /// Card Capacity Status; together with `pwr_up_status` this marks SDHC.
    pub ccs, _: 30;
    pub uhs2, _: 29;
    pub switch_1v8, _: 24;
    /// V_DD voltage window, OCR bits 23..8.
    pub u16, voltage_window, _: 23, 8;
}

impl Ocr {
    pub fn from_bytes(raw: [u8; 4]) -> Self {
        Ocr(u32::from_be_bytes(raw))
    }

    /// High capacity card, block-addressed on the wire.
    pub fn high_capacity(self) -> bool {
        self.pwr_up_status() && self.ccs()
    }
}
