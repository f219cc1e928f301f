//! Extended label lattice: `blank, l1, blank, l2, ..., lk, blank`.

/// Length of the extended sequence for `label_len` symbols.
#[inline]
pub fn extended_len(label_len: usize) -> usize {
    2 * label_len + 1
}

/// Class emitted at extended position `s`.
#[inline]
pub fn extended_label(labels: &[i32], s: usize, blank: usize) -> usize {
    if s % 2 == 0 {
        blank
    } else {
        labels[s / 2] as usize
    }
}

/// Writes the extended sequence of `labels` into `out`, which must hold
/// exactly `extended_len(labels.len())` slots.
pub fn fill_extended(labels: &[i32], blank: usize, out: &mut [u32]) {
    debug_assert_eq!(out.len(), extended_len(labels.len()));
    for (s, slot) in out.iter_mut().enumerate() {
        *slot = extended_label(labels, s, blank) as u32;
    }
}

/// Whether the transition `s - 2 -> s` may skip the blank in between.
///
/// Only legal onto a symbol that differs from the one two positions back;
/// a blank between identical symbols is mandatory.
#[inline]
pub fn can_skip(extended: &[u32], s: usize, blank: usize) -> bool {
    s >= 2 && extended[s] as usize != blank && extended[s] != extended[s - 2]
}

/// Number of adjacent identical symbols, each of which needs a separating blank.
pub fn repeats(labels: &[i32]) -> usize {
    labels.windows(2).filter(|pair| pair[0] == pair[1]).count()
}

/// Fewest timesteps any alignment of `labels` can use.
pub fn required_time(labels: &[i32]) -> usize {
    labels.len() + repeats(labels)
}

/// Whether `labels` can be aligned within `input_len` timesteps.
pub fn is_feasible(labels: &[i32], input_len: usize) -> bool {
    required_time(labels) <= input_len
}
