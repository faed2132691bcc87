//! Program identity and Postgres server version handling.
//!
//! Server version numbers use Postgres's internal numeric format:
//! `MAJOR * 10000 + MINOR * 100 + PATCH` before version 10, and
//! `MAJOR * 10000 + MINOR` from version 10 onwards.

use std::num::NonZeroI32;

/// Name reported to the server-side extension during the version handshake.
pub const PROGRAM_NAME: &str = "pg_repack";

/// Client version; both `repack.version()` and `repack.version_sql()` must
/// report exactly `"{PROGRAM_NAME} {PROGRAM_VERSION}"` for a database to be
/// processed.
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// First server version whose `pg_terminate_backend` is usable for lock
/// escalation.
pub const POSTGRES_84: i32 = 80400;

/// Returns the combined identity string used on both sides of the handshake.
pub fn program_banner() -> String {
    format!("{PROGRAM_NAME} {PROGRAM_VERSION}")
}

/// Returns [`true`] if the server version meets or exceeds the required
/// version. An unknown server version compares as not meeting anything.
pub fn meets_version(server_version: Option<NonZeroI32>, required_version: i32) -> bool {
    server_version.is_some_and(|v| v.get() >= required_version)
}

/// Extracts the numeric server version from a `server_version` parameter
/// string such as `"16.2 (Debian 16.2-1.pgdg120+2)"`, `"9.6.24"` or
/// `"17devel"`.
///
/// Returns `None` if no leading major number can be parsed.
pub fn extract_server_version(server_version_str: &str) -> Option<NonZeroI32> {
    let version_part = server_version_str.split_whitespace().next()?;
    let mut components = version_part.split('.');

    let major = leading_digits(components.next()?)?;
    let minor = components.next().and_then(leading_digits).unwrap_or(0);
    let patch = components.next().and_then(leading_digits).unwrap_or(0);

    let version = if major >= 10 {
        major * 10000 + minor
    } else {
        major * 10000 + minor * 100 + patch
    };

    NonZeroI32::new(version)
}

/// Parses the leading decimal digits of a version component, tolerating
/// suffixes like `24rc1` or `0devel`.
fn leading_digits(component: &str) -> Option<i32> {
    let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_banner_format() {
        let banner = program_banner();
        assert!(banner.starts_with("pg_repack "));
        assert_eq!(banner, format!("pg_repack {PROGRAM_VERSION}"));
    }

    #[test]
    fn test_extract_modern_versions() {
        assert_eq!(extract_server_version("16.2"), NonZeroI32::new(160002));
        assert_eq!(
            extract_server_version("15.6 (Debian 15.6-1.pgdg120+2)"),
            NonZeroI32::new(150006)
        );
        assert_eq!(extract_server_version("10.23"), NonZeroI32::new(100023));
    }

    #[test]
    fn test_extract_legacy_versions() {
        assert_eq!(extract_server_version("9.6.24"), NonZeroI32::new(90624));
        assert_eq!(extract_server_version("8.4.22"), NonZeroI32::new(80422));
        assert_eq!(extract_server_version("8.3.23"), NonZeroI32::new(80323));
    }

    #[test]
    fn test_extract_devel_versions() {
        assert_eq!(extract_server_version("17devel"), NonZeroI32::new(170000));
        assert_eq!(extract_server_version("16beta1"), NonZeroI32::new(160000));
        assert_eq!(extract_server_version("9.6rc1"), NonZeroI32::new(90600));
    }

    #[test]
    fn test_extract_invalid_versions() {
        assert_eq!(extract_server_version(""), None);
        assert_eq!(extract_server_version("devel"), None);
        assert_eq!(extract_server_version("   "), None);
    }

    #[test]
    fn test_meets_version_gates_escalation() {
        assert!(meets_version(extract_server_version("8.4.22"), POSTGRES_84));
        assert!(meets_version(extract_server_version("16.2"), POSTGRES_84));
        assert!(!meets_version(extract_server_version("8.3.23"), POSTGRES_84));
        assert!(!meets_version(None, POSTGRES_84));
    }
}
