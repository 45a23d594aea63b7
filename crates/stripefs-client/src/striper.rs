//! Stripe arithmetic for file layouts
//!
//! Maps logical file sizes onto the objects that hold them. File bytes are
//! dealt in `stripe_unit` chunks round-robin over `stripe_count` objects;
//! one full pass over the object set covering `object_size` bytes each is a
//! stripe period.

use stripefs_common::FileLayout;

/// Bytes covered by one stripe period: `stripe_count` objects filled to
/// `object_size` each.
#[must_use]
pub fn period(layout: &FileLayout) -> u64 {
    u64::from(layout.stripe_count) * u64::from(layout.object_size)
}

/// Number of objects needed to hold `size` bytes under `layout`.
///
/// Full periods contribute `stripe_count` objects each. A partial tail
/// period smaller than one stripe pass touches only the objects its stripe
/// units reach; a larger tail touches the whole object set.
#[must_use]
pub fn object_count(layout: &FileLayout, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }

    let unit = u64::from(layout.stripe_unit);
    let count = u64::from(layout.stripe_count);
    let period = period(layout);

    let num_periods = size.div_ceil(period);
    let tail = size % period;

    let mut objects = num_periods * count;
    if tail > 0 && tail < count * unit {
        // tail shorter than one stripe pass: trailing objects untouched
        objects -= count - tail.div_ceil(unit);
    }
    objects
}
