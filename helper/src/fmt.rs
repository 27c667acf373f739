//! Formatting.

/// Binary unit suffixes, 1024-based.
const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count as a human readable size.
///
/// ```rust
/// # use galena_helper::fmt::as_size;
/// assert_eq!(as_size(0), "0 B");
/// assert_eq!(as_size(512), "512 B");
/// assert_eq!(as_size(2 * 1024 * 1024), "2.00 MiB");
/// assert_eq!(as_size(4_718_592), "4.50 MiB");
/// ```
pub fn as_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn boundaries() {
        assert_eq!(as_size(1023), "1023 B");
        assert_eq!(as_size(1024), "1.00 KiB");
        assert_eq!(as_size(1024 * 1024 - 1), "1024.00 KiB");
        assert_eq!(as_size(u64::MAX), "16777216.00 TiB");
    }
}
