const KUNIT: usize = 1024; // a kunit of memory is 1024 things (bytes, kilobytes, ...)
const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E']; // KiB, MiB, GiB, ...

/// Human-readable representation of a memory size in bytes.
pub fn memory_size(total: usize) -> String {
    if total < KUNIT {
        return format!("{total} B");
    }
    let mut idx = 0;
    let mut d = KUNIT;
    let mut n = total / KUNIT;
    while n >= KUNIT {
        d *= KUNIT;
        idx += 1;
        n /= KUNIT;
    }
    // usize tops out at 16 EiB, so idx stays in range
    format!("{:.1} {}iB", total as f64 / d as f64, PREFIXES[idx])
}

/// Sign-extend the `bits` low bits of `value` to 32 bits.
pub fn sign_extend(value: u32, bits: u32) -> u32 {
    debug_assert!(bits > 0 && bits <= 32);
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}
