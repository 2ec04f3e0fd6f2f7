const BUCKET_SCALE: f64 = i32::MAX as f64;

/// Hash an identifier into a signed 32-bit value.
///
/// Each character contributes its first UTF-16 code unit through `h = (h << 5) - h + unit`, and
/// every step wraps in two's-complement 32-bit arithmetic. This is the classic `31 * h + c` string
/// hash, so the result is identical on every platform.
pub fn hash_identifier(id: &str) -> i32 {
    let mut units = [0u16; 2];
    id.chars().fold(0i32, |hash, c| {
        let unit = c.encode_utf16(&mut units)[0];
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

/// Map an identifier to a bucket in `[0, 1]`.
pub fn bucket(id: &str) -> f64 {
    // |i32::MIN| is one past the scale
    (f64::from(hash_identifier(id).unsigned_abs()) / BUCKET_SCALE).min(1.0)
}

/// Returns true if the identifier falls inside a rollout of `percentage` percent.
///
/// A zero percent rollout never includes anyone, even an identifier whose bucket is exactly 0.
pub(crate) fn percentage_includes(id: &str, percentage: u8) -> bool {
    match percentage {
        0 => false,
        p if p >= 100 => true,
        p => bucket(id) * 100.0 <= f64::from(p),
    }
}
