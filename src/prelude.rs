use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

pub type RwArc<T> = Arc<RwLock<T>>;

/// `sha256!()` for an empty hasher, `sha256!(a, b, ..)` to feed it up front
#[macro_export]
macro_rules! sha256 {
    () => {
        sha2::Sha256::new()
    };
    ($($data:expr),+ $(,)?) => {{
        let mut hasher = sha2::Sha256::new();
        $(
            hasher.update($data);
        )+
        hasher
    }};
}

/// Unix seconds, as stored in job records
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

const SIZE_UNITS: &[(&[&str], u64)] = &[
    (&["", "b"], 1),
    (&["k", "kb", "kib"], KIB),
    (&["m", "mb", "mib"], MIB),
    (&["g", "gb", "gib"], GIB),
];

/// Byte count from `20MB`, `512mb`, `8k`, `0.5g` or a bare number.
/// Units are binary and case-insensitive.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_ascii_lowercase();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let unit = unit.trim();

    let value: f64 = number.parse()
        .map_err(|_| format!("Invalid number: {:?}", number))?;
    let scale = SIZE_UNITS.iter()
        .find(|(names, _)| names.contains(&unit))
        .map(|(_, scale)| *scale)
        .ok_or_else(|| format!("Unknown size suffix: {:?}. Use b, kb, mb, or gb", unit))?;

    Ok((value * scale as f64) as u64)
}

/// Like [`parse_size`], in KiB (rlimits and cgroup ceilings are set from this)
pub fn parse_size_kb(s: &str) -> Result<u64, String> {
    Ok(parse_size(s)? / KIB)
}

/// `5MB` for whole mebibytes, a plain byte count otherwise
pub fn format_size(bytes: u64) -> String {
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("8kb").unwrap(), 8 * 1024);
        assert_eq!(parse_size("20MB").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_size(" 2m ").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1GiB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("0.5k").unwrap(), 512);
        assert_eq!(parse_size("5 mb").unwrap(), 5 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12tb").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_size_kb() {
        assert_eq!(parse_size_kb("128mb").unwrap(), 128 * 1024);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(5 * 1024 * 1024), "5MB");
        assert_eq!(format_size(1500), "1500 bytes");
    }
}
