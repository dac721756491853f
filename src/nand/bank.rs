//! Translation from interleaved super-block addresses to (chip, block) pairs

use super::NandGeometry;

/// Maps a super-block index and a bank (interleave column) onto a physical block.
///
/// With an interleave factor of `il`, chips are grouped into rows of `il` chips. Super-blocks
/// `0..blocks_per_chip` live in the first row, the next `blocks_per_chip` in the second row, and so
/// on; the bank selects the chip within the row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BankMap {
    chips: u32,
    blocks_per_chip: u32,
    interleave: u32,
}

impl BankMap {
    pub fn new(geometry: &NandGeometry, interleave: u32) -> Self {
        Self {
            chips: geometry.chips,
            blocks_per_chip: geometry.blocks_per_chip,
            interleave,
        }
    }

    pub fn interleave(&self) -> u32 {
        self.interleave
    }

    /// Get the (chip, block) of a super-block in the given bank, or None if it falls off the array
    pub fn translate(&self, bank: u32, super_block: u32) -> Option<(u32, u32)> {
        if bank >= self.interleave {
            return None;
        }
        let chip = (super_block / self.blocks_per_chip)
            .checked_mul(self.interleave)?
            .checked_add(bank)?;
        let block = super_block % self.blocks_per_chip;
        (chip < self.chips).then_some((chip, block))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::TEST_LAYOUT;

    #[test]
    fn test_sequential() {
        let banks = BankMap::new(&TEST_LAYOUT.geometry(), 1);
        assert_eq!(banks.translate(0, 0), Some((0, 0)));
        assert_eq!(banks.translate(0, 63), Some((0, 63)));
        assert_eq!(banks.translate(0, 64), Some((1, 0)));
        assert_eq!(banks.translate(0, 127), Some((1, 63)));
        assert_eq!(banks.translate(0, 128), None);
        assert_eq!(banks.translate(1, 0), None);
    }

    #[test]
    fn test_interleaved() {
        let mut geometry = TEST_LAYOUT.geometry();
        geometry.chips = 4;
        let banks = BankMap::new(&geometry, 2);
        assert_eq!(banks.translate(0, 5), Some((0, 5)));
        assert_eq!(banks.translate(1, 5), Some((1, 5)));
        assert_eq!(banks.translate(0, 64), Some((2, 0)));
        assert_eq!(banks.translate(1, 127), Some((3, 63)));
        assert_eq!(banks.translate(1, 128), None);
    }
}
