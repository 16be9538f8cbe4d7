// Sequence and acknowledgment numbers live in modulo 2^32 space. rfc9293 3.4
// Two numbers are ordered by the shorter distance between them, so every
// comparison below stays valid across the 0xffffffff -> 0 wrap.

const MAX_SEQ: u32 = u32::MAX;

// true if seq1 < seq2
pub fn seq_less_than(seq1: u32, seq2: u32) -> bool {
    (seq1 < seq2 && seq2 - seq1 < (MAX_SEQ / 2)) || (seq1 > seq2 && seq1 - seq2 > (MAX_SEQ / 2))
}

// true if seq1 <= seq2
pub fn seq_less_equal(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_less_than(seq1, seq2)
}

// true if seq1 > seq2
pub fn seq_greater_than(seq1: u32, seq2: u32) -> bool {
    seq_less_than(seq2, seq1)
}

// true if seq1 >= seq2
pub fn seq_greater_equal(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_greater_than(seq1, seq2)
}

// true if low <= target <= high, where the window may straddle the wrap (low > high).
pub fn seq_in_window(target: u32, low: u32, high: u32) -> bool {
    target.wrapping_sub(low) <= high.wrapping_sub(low)
}
