// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a block boundary.
pub fn calc<N: PrimInt>(offset: N, block_size: N) -> N {
    let r = offset % block_size;
    if r == N::zero() {
        N::zero()
    } else {
        block_size - r
    }
}

/// Round to the next multiple of the block size.
pub fn round<N: PrimInt>(offset: N, block_size: N) -> Option<N> {
    let remain = calc(offset, block_size);
    offset.checked_add(&remain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_block() {
        assert_eq!(round(0u64, 512), Some(0));
        assert_eq!(round(1u64, 512), Some(512));
        assert_eq!(round(512u64, 512), Some(512));
        assert_eq!(round(16385u32, 4096), Some(20480));
        assert_eq!(round(u32::MAX, 4096), None);
    }
}
