//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

/// A fixed-width counter that wraps from its maximum back to zero, such as an RTP sequence
/// number or timestamp.
pub trait WrappingCounter: Copy + Eq + Into<u64> {
    /// The bit width of the counter.
    const WIDTH: u32;

    /// Returns true iff `self` comes after `other`, taking a possible rollover into account.
    ///
    /// Exactly half way around the ring the numerically larger value is considered newer, so
    /// the relation stays antisymmetric.
    fn is_newer_than(self, other: Self) -> bool;

    /// Returns the newer of the two values.
    fn latest(self, other: Self) -> Self {
        if self.is_newer_than(other) {
            self
        } else {
            other
        }
    }
}

macro_rules! wrapping_counter {
    ($T:ty) => {
        impl WrappingCounter for $T {
            const WIDTH: u32 = <$T>::BITS;

            fn is_newer_than(self, other: Self) -> bool {
                const BREAKPOINT: $T = 1 << (<$T>::BITS - 1);
                let diff = self.wrapping_sub(other);
                if diff == BREAKPOINT {
                    self > other
                } else {
                    self != other && diff < BREAKPOINT
                }
            }
        }
    };
}

wrapping_counter!(u8);
wrapping_counter!(u16);
wrapping_counter!(u32);

/// Expands a truncated counter value to the full length by using the previous largest value as
/// guide to rollover/rollunder. Updates this maximum.
///
/// # Arguments
///
/// * `truncated` - The truncated counter value.
/// * `max` - The previously returned maximum from this function.
pub fn expand_truncated_counter<Truncated: WrappingCounter>(
    truncated: Truncated,
    max: &mut u64,
) -> u64 {
    let full = expand_truncated_counter_near(truncated, *max);
    if full > *max {
        *max = full;
    }
    full
}

/// Like [`expand_truncated_counter`], but without a previous maximum the first value seeds it one
/// rollover up, so that values shortly before the first one (across a wrap) still expand below it.
pub fn expand_truncated_counter_seeded<Truncated: WrappingCounter>(
    truncated: Truncated,
    max: &mut Option<u64>,
) -> u64 {
    let max = max.get_or_insert_with(|| (1u64 << Truncated::WIDTH) | truncated.into());
    expand_truncated_counter(truncated, max)
}

/// Like [`expand_truncated_counter`], but leaves the maximum untouched. Useful for looking up
/// values that have already been expanded once.
pub fn expand_truncated_counter_near<Truncated: WrappingCounter>(
    truncated: Truncated,
    max: u64,
) -> u64 {
    let width = Truncated::WIDTH;
    let mask: u64 = (1 << width) - 1;
    let really_big: u64 = 1 << (width - 1);

    let truncated: u64 = truncated.into();
    let truncated_max = max & mask;
    let max_roc = max >> width;
    let roc: u64 = if truncated_max > truncated && truncated_max - truncated > really_big {
        // Truncated is a lot smaller than the max;  It's likely a rollover.
        max_roc + 1
    } else if max_roc > 0 && truncated > truncated_max && truncated - truncated_max > really_big {
        // Truncated is a lot bigger than the max;  It's likely a rollunder.
        max_roc - 1
    } else {
        // Truncated is close to the max, so it's neither rollover nor rollunder.
        max_roc
    };
    (roc << width) | (truncated & mask)
}
