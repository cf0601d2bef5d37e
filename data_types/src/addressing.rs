//! Pure addressing arithmetic for the vertical layout: position to
//! (segment, index), time to ring slot, ring slot back to wall-clock, and
//! the lap-counter versioning that marks slots stale without writing them.
//!
//! All functions work on epoch milliseconds; nothing here touches storage.

/// Number of distinct lap values. Laps live in a `SMALLINT` column, so the
/// counter saturates one short of the signed 16-bit maximum.
pub const VER_LAPS: i64 = 32_767;

/// Default number of archives packed into one wide row. Stored per bundle
/// at creation, so bundles with other widths can coexist.
pub const DEFAULT_SEGMENT_WIDTH: i32 = 200;

/// Segment of a bundle position: which wide-row family it lives in.
pub fn seg_of(pos: i64, width: i32) -> i32 {
    (pos / width as i64) as i32
}

/// Index of a bundle position within its segment's arrays, 0-based.
pub fn idx_of(pos: i64, width: i32) -> i32 {
    (pos % width as i64) as i32
}

/// The ring slot holding time `time_ms` for an archive of `size` slots at
/// `step_ms` per slot.
pub fn slot_index(time_ms: i64, step_ms: i64, size: i32) -> i32 {
    ((time_ms / step_ms) % size as i64) as i32
}

/// The lap counter value a write at `time_ms` carries.
pub fn lap_of(time_ms: i64, step_ms: i64, size: i32) -> i16 {
    ((time_ms / (step_ms * size as i64)) % VER_LAPS) as i16
}

/// The lap counter a slot must carry to be live, given the archive's
/// latest write. Slots past the latest slot were written on the previous
/// lap; the subtraction wraps symmetrically at the counter boundary.
pub fn expected_version(latest_ms: i64, step_ms: i64, size: i32, i: i32) -> i16 {
    let latest_ver = lap_of(latest_ms, step_ms, size) as i64;
    let behind = (i > slot_index(latest_ms, step_ms, size)) as i64;
    ((latest_ver - behind + VER_LAPS) % VER_LAPS) as i16
}

/// Wall-clock of slot `i`, reconstructed from the latest write: slot
/// offsets from `latest` are strictly non-positive, wrapping the ring so
/// the latest slot maps to `latest` itself and the slot just after it maps
/// to the oldest retained sample.
pub fn slot_time_ms(latest_ms: i64, step_ms: i64, size: i32, i: i32) -> i64 {
    let latest_i = slot_index(latest_ms, step_ms, size);
    let distance = (size + latest_i - i) % size;
    latest_ms - step_ms * distance as i64
}

/// Earliest slot time still retained, one whole lap minus a step back.
pub fn earliest_ms(latest_ms: i64, step_ms: i64, size: i32) -> i64 {
    latest_ms - step_ms * (size as i64 - 1)
}

/// Smallest time at or after `from_ms` on the slot grid anchored at
/// `latest_ms`. Timeline joins against the read view compare timestamps
/// for equality, so the range start must sit on the grid.
pub fn align_from_ms(latest_ms: i64, step_ms: i64, from_ms: i64) -> i64 {
    latest_ms - step_ms * (latest_ms - from_ms).div_euclid(step_ms)
}

/// Bucket width for a range read: never finer than the archive step, and
/// coarse enough to keep the emitted point count at or under `max_points`.
pub fn bucket_ms(from_ms: i64, to_ms: i64, step_ms: i64, max_points: i64) -> i64 {
    step_ms.max((to_ms - from_ms) / max_points.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seg_idx_of_pos() {
        assert_eq!((seg_of(0, 200), idx_of(0, 200)), (0, 0));
        assert_eq!((seg_of(199, 200), idx_of(199, 200)), (0, 199));
        assert_eq!((seg_of(200, 200), idx_of(200, 200)), (1, 0));
        assert_eq!((seg_of(451, 200), idx_of(451, 200)), (2, 51));
    }

    #[test]
    fn slot_of_time() {
        assert_eq!(slot_index(10_000, 1000, 10), 0);
        assert_eq!(slot_index(11_000, 1000, 10), 1);
        assert_eq!(slot_index(19_999, 1000, 10), 9);
    }

    #[test]
    fn latest_slot_maps_to_latest_itself() {
        let (latest, step, size) = (11_000, 1000, 10);
        let li = slot_index(latest, step, size);
        assert_eq!(slot_time_ms(latest, step, size, li), latest);
        // the slot right after the latest is the oldest retained one
        let oldest = (li + 1) % size;
        assert_eq!(
            slot_time_ms(latest, step, size, oldest),
            latest - step * (size as i64 - 1)
        );
        assert_eq!(earliest_ms(latest, step, size), 2_000);
    }

    #[test]
    fn expected_version_splits_at_latest_slot() {
        // latest 11000 at step 1000 x 10: lap 1, slot 1
        let (latest, step, size) = (11_000, 1000, 10);
        assert_eq!(expected_version(latest, step, size, 0), 1);
        assert_eq!(expected_version(latest, step, size, 1), 1);
        for i in 2..10 {
            assert_eq!(expected_version(latest, step, size, i), 0);
        }
    }

    #[test]
    fn expected_version_wraps_symmetrically() {
        // latest inside lap 0 of a wrapped counter: slots behind the write
        // must expect lap 32766, not -1
        let (step, size) = (1000, 10);
        let latest = VER_LAPS * step * size as i64 + 1000; // lap 32767 -> 0, slot 1
        assert_eq!(lap_of(latest, step, size), 0);
        assert_eq!(expected_version(latest, step, size, 1), 0);
        assert_eq!(expected_version(latest, step, size, 5), 32_766);
    }

    #[test]
    fn align_from_lands_on_grid() {
        // grid anchored at 11000, step 1000: 2000 is already aligned
        assert_eq!(align_from_ms(11_000, 1000, 2_000), 2_000);
        // latest off the round grid keeps its own phase
        assert_eq!(align_from_ms(11_500, 1000, 2_000), 2_500);
        // from past latest aligns forward, never backward
        assert_eq!(align_from_ms(11_000, 1000, 12_500), 13_000);
    }

    #[test]
    fn bucket_never_finer_than_step() {
        assert_eq!(bucket_ms(0, 10_000, 1000, 1000), 1000);
        assert_eq!(bucket_ms(0, 100_000, 1000, 10), 10_000);
        assert_eq!(bucket_ms(0, 100_000, 1000, 0), 100_000);
    }

    proptest! {
        // Round-trip: writing at T and asking for T's own slot returns T,
        // and every retained slot k steps back returns T - k * step.
        #[test]
        fn prop_slot_time_round_trip(
            t in 0i64..4_000_000_000_000,
            step in 1i64..100_000,
            size in 2i32..5_000,
            k in 0i32..5_000,
        ) {
            let k = k % size;
            let li = slot_index(t, step, size);
            // the latest slot maps to latest itself, aligned or not
            prop_assert_eq!(slot_time_ms(t, step, size, li), t);
            let i = (li - k + size) % size;
            prop_assert_eq!(slot_time_ms(t, step, size, i), t - k as i64 * step);
        }

        // Position round-trip through (seg, idx).
        #[test]
        fn prop_pos_seg_idx(pos in 0i64..1_000_000, width in 1i32..1_000) {
            let (seg, idx) = (seg_of(pos, width), idx_of(pos, width));
            prop_assert!(idx >= 0 && idx < width);
            prop_assert_eq!(seg as i64 * width as i64 + idx as i64, pos);
        }

        // A slot's own write version always matches the expected version
        // computed from any later write in the same lap window.
        #[test]
        fn prop_written_slot_is_live(
            t in 0i64..4_000_000_000_000,
            step in 1i64..100_000,
            size in 2i32..5_000,
            ahead in 0i32..5_000,
        ) {
            let t = t - t % step;
            let ahead = ahead % size;
            let ver = lap_of(t, step, size);
            let latest = t + ahead as i64 * step;
            prop_assert_eq!(
                expected_version(latest, step, size, slot_index(t, step, size)),
                ver
            );
        }
    }
}
