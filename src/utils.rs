/// Rounds `val` up to the next multiple of `step`. `step` need not be a power of two.
#[must_use]
pub const fn round_up(val: u64, step: u64) -> u64 {
    val.div_ceil(step) * step
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Number of set bits in the low byte of `val`.
#[must_use]
pub const fn hweight8(val: u32) -> u32 {
    (val & 0xff).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_and_check_alignment() {
        assert_eq!(round_up(0x4a41, 0x1000), 0x5000);
        assert_eq!(round_up(10, 3), 12);
        assert!(is_aligned(0x20000, 0x10000));
        assert!(!is_aligned(0x21000, 0x10000));
    }

    #[test]
    fn hweight8_counts_low_byte_only() {
        assert_eq!(hweight8(0xff), 8);
        assert_eq!(hweight8(0x1ff), 8);
        assert_eq!(hweight8(0x0f), 4);
        assert_eq!(hweight8(0), 0);
    }
}
