// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

/// Parse the decimal prefix of a build string, eg. `10B329` -> 10. Returns 0
/// if the string does not start with a digit, which callers treat the same as
/// an unknown build.
pub fn decimal_prefix(s: &str) -> u32 {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Get the file stem of an archive path for use as a cache directory name.
/// `Restore/iPhone5,2_10.3.4_14G61.ipsw` -> `iPhone5,2_10.3.4_14G61`.
pub fn archive_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ipsw".to_owned())
}

/// The final path segment of a URL, used to name cached downloads.
pub fn url_basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_prefix_of_build() {
        assert_eq!(decimal_prefix("14G61"), 14);
        assert_eq!(decimal_prefix("7B405"), 7);
        assert_eq!(decimal_prefix("G61"), 0);
        assert_eq!(decimal_prefix(""), 0);
    }

    #[test]
    fn url_basename_of_ipsw() {
        assert_eq!(
            url_basename("http://example.com/fw/x12220000_5_Recovery.ipsw"),
            "x12220000_5_Recovery.ipsw"
        );
        assert_eq!(url_basename("no-slashes"), "no-slashes");
    }
}
