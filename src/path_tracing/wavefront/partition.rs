// src/path_tracing/wavefront/partition.rs
// Count / prefix-sum / scatter primitive behind every active-index list
// Queued, terminated, compaction and shader-sorted lists are all partitions of slot indices by key

/// Exclusive prefix sum in place. Returns the total.
pub fn exclusive_prefix_sum(values: &mut [u32]) -> u32 {
    let mut running = 0u32;
    for value in values.iter_mut() {
        let count = *value;
        *value = running;
        running += count;
    }
    running
}

/// Scatter each keyed index to `out[offsets[key]]`, advancing that bucket's offset.
///
/// Writes at or beyond `out.len()` are dropped. Returns how many indices were written.
pub fn scatter_by_key<I>(items: I, offsets: &mut [u32], out: &mut [i32]) -> usize
where
    I: IntoIterator<Item = (usize, Option<usize>)>,
{
    let mut written = 0;
    for (index, key) in items {
        let Some(offset) = key.and_then(|key| offsets.get_mut(key)) else {
            continue;
        };
        let slot = *offset as usize;
        *offset += 1;
        if let Some(dst) = out.get_mut(slot) {
            *dst = index as i32;
            written += 1;
        }
    }
    written
}
