//! URL-safe slug and file name normalization.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Derives a URL slug from a display name.
///
/// Lowercases, strips diacritics, turns whitespace runs into `-`, drops
/// everything outside `[a-z0-9-]`, collapses repeated dashes and trims
/// dashes from both ends. May return an empty string.
pub fn slugify(name: &str) -> String {
    clean(name, false)
}

/// Normalizes an uploaded file name the same way as [`slugify`], but keeps
/// `.` so extensions survive.
pub fn normalize_filename(name: &str) -> String {
    clean(name, true)
}

fn clean(input: &str, keep_dot: bool) -> String {
    let lowered = input.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = true;

    for c in lowered.nfd().filter(|c| !is_combining_mark(*c)) {
        let mapped = if c.is_whitespace() || c == '-' || c == '_' {
            Some('-')
        } else if c.is_ascii_alphanumeric() || (keep_dot && c == '.') {
            Some(c)
        } else {
            None
        };

        match mapped {
            Some('-') => {
                if !last_dash {
                    out.push('-');
                    last_dash = true;
                }
            }
            Some(c) => {
                out.push(c);
                last_dash = false;
            }
            None => {}
        }
    }

    while out.ends_with('-') {
        out.pop();
    }
    out
}
