//! Page ordering and cover selection
//!
//! Natural ordering puts "2.jpg" before "10.jpg", the way scanners number
//! pages. Cover selection scans a sorted name list for conventional cover
//! names before falling back to the first page.

use std::cmp::Ordering;

/// Name fragments that mark an entry as the intended cover, best first.
const COVER_HINTS: &[&str] = &["cover", "folder", "front"];

/// Zero-padded leading indices scanners use for the front page, best first.
const LEADING_INDEX_HINTS: &[&str] = &["000", "001", "00", "0"];

/// Natural-order comparison, case-insensitive, with a byte-wise tiebreak so
/// names that differ only in case still sort deterministically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natord::compare_ignore_case(a, b).then_with(|| a.cmp(b))
}

/// Pick the cover page from a naturally sorted name list.
///
/// Textual hints match anywhere in the final path segment; index hints must
/// lead the file stem. First match in priority order wins, otherwise the
/// first page of the list is the cover.
pub fn select_cover(names: &[String]) -> Option<&str> {
    for hint in COVER_HINTS {
        if let Some(found) = names
            .iter()
            .find(|name| base_name(name).to_ascii_lowercase().contains(hint))
        {
            return Some(found.as_str());
        }
    }
    for hint in LEADING_INDEX_HINTS {
        if let Some(found) = names
            .iter()
            .find(|name| stem(base_name(name)).starts_with(hint))
        {
            return Some(found.as_str());
        }
    }
    names.first().map(|s| s.as_str())
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}
