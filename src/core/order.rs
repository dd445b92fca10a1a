//! Human friendly ordering of file names, so that `image9` sorts before `image22`.

use std::cmp::Ordering;

/// Compare two strings, treating runs of ASCII digits as numbers.
///
/// Leading zeros are ignored, a longer run of significant digits is larger,
/// equal length runs compare digit by digit. Everything else compares by
/// character, and a string that is a prefix of the other sorts first.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let (a_start, a_end) = digit_run(a, i);
            let (b_start, b_end) = digit_run(b, j);
            let ordering = (a_end - a_start)
                .cmp(&(b_end - b_start))
                .then_with(|| a[a_start..a_end].cmp(&b[b_start..b_end]));
            if ordering != Ordering::Equal {
                return ordering;
            }
            i = a_end;
            j = b_end;
        } else {
            match a[i].cmp(&b[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                ordering => return ordering,
            }
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

/// Significant digits of the run starting at `start`, as `(first, end)`.
/// A run of only zeros keeps its last zero.
fn digit_run(s: &[u8], start: usize) -> (usize, usize) {
    let mut end = start;
    while end < s.len() && s[end].is_ascii_digit() {
        end += 1;
    }
    let mut first = start;
    while first + 1 < end && s[first] == b'0' {
        first += 1;
    }
    (first, end)
}

/// Sort in place with [`natural_cmp`].
pub fn sort_natural<S: AsRef<str>>(items: &mut [S]) {
    items.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}
