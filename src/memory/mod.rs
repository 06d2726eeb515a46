//! Raw memory acquisition for code buffers.
//!
//! [`virtual_memory`] wraps the operating system's page mapping calls and
//! [`allocator`] builds the two allocation strategies on top of it.

use num_traits::PrimInt;

pub mod allocator;
pub mod virtual_memory;

/// Instruction word size. Freshly allocated code memory starts on this boundary.
pub const CODE_ALIGNMENT: usize = 4;

pub fn is_power_of_two<T: PrimInt>(x: T) -> bool {
    x != T::zero() && (x & (x - T::one())) == T::zero()
}

pub fn is_aligned<T: PrimInt>(x: T, alignment: T) -> bool {
    assert!(is_power_of_two(alignment));
    (x & (alignment - T::one())) == T::zero()
}

pub fn is_aligned_ptr<T>(x: *const T, alignment: usize) -> bool {
    is_aligned(x as usize, alignment)
}

pub fn round_down<T: PrimInt>(x: T, alignment: T) -> T {
    assert!(is_power_of_two(alignment));
    x & !(alignment - T::one())
}

pub fn round_up<T: PrimInt>(x: T, alignment: T) -> T {
    round_down(x + alignment - T::one(), alignment)
}

/// Like [`round_up`], but `None` when the result does not fit in `T`.
pub fn checked_round_up<T: PrimInt>(x: T, alignment: T) -> Option<T> {
    Some(round_down(x.checked_add(&(alignment - T::one()))?, alignment))
}

/// Number of bytes needed to bring `x` up to the next multiple of `alignment`.
pub fn padding_for<T: PrimInt>(x: T, alignment: T) -> T {
    round_up(x, alignment) - x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powers_of_two() {
        assert!(is_power_of_two(1usize));
        assert!(is_power_of_two(4096usize));
        assert!(!is_power_of_two(0usize));
        assert!(!is_power_of_two(12u32));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(0usize, 4), 0);
        assert_eq!(round_up(1usize, 4), 4);
        assert_eq!(round_up(4usize, 4), 4);
        assert_eq!(round_up(4097usize, 4096), 8192);
        assert_eq!(round_down(4097usize, 4096), 4096);
        assert_eq!(round_down(3u32, 4), 0);
    }

    #[test]
    fn checked_rounding() {
        assert_eq!(checked_round_up(4097usize, 4096), Some(8192));
        assert_eq!(checked_round_up(usize::MAX - 4096, 4096), Some(usize::MAX - 4095));
        assert_eq!(checked_round_up(usize::MAX - 10, 4096), None);
        assert_eq!(checked_round_up(u8::MAX, 2), None);
    }

    #[test]
    fn padding() {
        assert_eq!(padding_for(3usize, 4), 1);
        assert_eq!(padding_for(8usize, 4), 0);
        assert_eq!(padding_for(9usize, 8), 7);
        assert!(is_aligned(16usize, 8));
        assert!(!is_aligned(18usize, 8));
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_alignment() {
        round_up(5usize, 3);
    }
}
