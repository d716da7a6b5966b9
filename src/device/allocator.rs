//! Device-name allocator (component B)
//!
//! Owns a fixed ordered sequence of legal device-name suffixes and picks the
//! next one that is neither actively in use nor previously flagged as
//! "likely bad" (spec §4.B). Reusing a name the provider hasn't internally
//! released yet leaves the new attachment stuck `attaching` indefinitely, so
//! the allocator always prefers a name nobody has ever seen rejected before
//! falling back to a likely-bad one.

use std::collections::HashSet;

/// `/dev/xvdba` .. `/dev/xvdzz`: two-letter suffixes over `b..z` x `a..z`,
/// skipping `a` as a second-position starting letter collision with the
/// kernel-reserved `/dev/xvda` root device range. This is the closed,
/// provider-legal device-name set referenced by spec §9's open question;
/// picked to match the real EBS CSI driver's allocator so the suffix space
/// comfortably exceeds any instance's attach limit.
fn legal_suffixes() -> &'static [&'static str] {
    static SUFFIXES: std::sync::OnceLock<Vec<&'static str>> = std::sync::OnceLock::new();
    SUFFIXES.get_or_init(|| {
        let mut out = Vec::with_capacity(25 * 26);
        for first in b'b'..=b'z' {
            for second in b'a'..=b'z' {
                let s: &'static str =
                    Box::leak(format!("{}{}", first as char, second as char).into_boxed_str());
                out.push(s);
            }
        }
        out
    })
}

/// The device path prefix used by this allocator's suffixes.
pub const DEVICE_PREFIX: &str = "/dev/xvd";

/// Render a legal-list suffix as a full device path.
pub fn device_path(suffix: &str) -> String {
    format!("{DEVICE_PREFIX}{suffix}")
}

/// Picks the next free device name given the names already in use and the
/// names previously rejected by the provider as "already in use".
///
/// 1. Scan the ordered list; return the first name in neither `existing` nor
///    `likely_bad`.
/// 2. If none, scan `likely_bad` (in allocator order) and return the first
///    one not in `existing` — a likely-bad name is retried only as a last
///    resort.
/// 3. Otherwise, there is nothing left to allocate.
pub fn next_device_name(
    existing: &HashSet<String>,
    likely_bad: &HashSet<String>,
) -> Result<String, NoNamesAvailable> {
    for suffix in legal_suffixes() {
        let path = device_path(suffix);
        if !existing.contains(&path) && !likely_bad.contains(&path) {
            return Ok(path);
        }
    }

    for suffix in legal_suffixes() {
        let path = device_path(suffix);
        if likely_bad.contains(&path) && !existing.contains(&path) {
            return Ok(path);
        }
    }

    Err(NoNamesAvailable)
}

#[derive(Debug, thiserror::Error)]
#[error("no device names available")]
pub struct NoNamesAvailable;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_returns_first_legal_name() {
        let existing = HashSet::new();
        let likely_bad = HashSet::new();
        let name = next_device_name(&existing, &likely_bad).unwrap();
        assert_eq!(name, "/dev/xvdba");
    }

    #[test]
    fn skips_existing_names() {
        let mut existing = HashSet::new();
        existing.insert("/dev/xvdba".to_string());
        existing.insert("/dev/xvdbb".to_string());
        let likely_bad = HashSet::new();
        let name = next_device_name(&existing, &likely_bad).unwrap();
        assert_eq!(name, "/dev/xvdbc");
    }

    #[test]
    fn prefers_fresh_name_over_likely_bad() {
        let existing = HashSet::new();
        let mut likely_bad = HashSet::new();
        likely_bad.insert("/dev/xvdba".to_string());
        let name = next_device_name(&existing, &likely_bad).unwrap();
        assert_eq!(name, "/dev/xvdbb");
    }

    #[test]
    fn falls_back_to_likely_bad_when_everything_else_is_taken() {
        let mut existing = HashSet::new();
        let mut likely_bad = HashSet::new();
        // Claim every fresh name except one likely-bad name.
        for first in b'b'..=b'z' {
            for second in b'a'..=b'z' {
                let path = device_path(&format!("{}{}", first as char, second as char));
                if path == "/dev/xvdbb" {
                    likely_bad.insert(path);
                } else {
                    existing.insert(path);
                }
            }
        }
        let name = next_device_name(&existing, &likely_bad).unwrap();
        assert_eq!(name, "/dev/xvdbb");
    }

    #[test]
    fn starved_allocator_fails() {
        let mut existing = HashSet::new();
        for first in b'b'..=b'z' {
            for second in b'a'..=b'z' {
                existing.insert(device_path(&format!("{}{}", first as char, second as char)));
            }
        }
        let likely_bad = HashSet::new();
        assert!(next_device_name(&existing, &likely_bad).is_err());
    }
}
