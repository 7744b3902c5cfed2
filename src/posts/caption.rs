//! Caption sanitation for harvested post titles.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Anything enclosed in square brackets or parentheses, non-greedy.
    static ref BRACKETED: Regex = Regex::new(r"[\[\(].*?[\]\)]").unwrap();

    /// Image resolutions like "1920x1080", "1920 × 1080" or "1920*1080".
    static ref RESOLUTION: Regex = Regex::new(r"\s*\d+\s*[x×\*,]\s*\d+\s*").unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    /// Usernames mentioned in titles, replaced by a neutral token.
    static ref USERNAME: Regex = Regex::new(r"@[_\d\w\.]+").unwrap();
}

const USERNAME_TOKEN: &str = "<usr>";

/// Sanitize a raw post title into a caption: lowercase, drop bracketed
/// spans and WxH resolutions, replace usernames with `<usr>`, strip
/// non-ASCII, and collapse whitespace.
pub fn sanitize(raw: &str) -> String {
    let mut caption = raw.to_lowercase();

    for pattern in [&*BRACKETED, &*RESOLUTION] {
        // Replace with a space so removals never glue neighboring words,
        // then collapse the leftovers.
        caption = pattern.replace_all(&caption, " ").into_owned();
        caption = WHITESPACE.replace_all(&caption, " ").trim().to_string();
    }

    caption = USERNAME.replace_all(&caption, USERNAME_TOKEN).into_owned();
    caption.retain(|c| c.is_ascii());
    WHITESPACE.replace_all(&caption, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_trims() {
        assert_eq!(sanitize("  My Rose Garden  "), "my rose garden");
    }

    #[test]
    fn removes_bracketed_spans() {
        assert_eq!(sanitize("my rose garden [OC] (2021)"), "my rose garden");
        assert_eq!(sanitize("[oc] morning dew"), "morning dew");
    }

    #[test]
    fn removes_resolutions() {
        assert_eq!(sanitize("wallpaper 1920x1080 of a rose"), "wallpaper of a rose");
        assert_eq!(sanitize("sunset 2560 × 1440"), "sunset");
    }

    #[test]
    fn replaces_usernames() {
        assert_eq!(sanitize("photo by @rose_lover99"), "photo by <usr>");
    }

    #[test]
    fn strips_non_ascii() {
        assert_eq!(sanitize("rosé garden 🌹"), "ros garden");
    }

    #[test]
    fn combined_rules() {
        assert_eq!(
            sanitize("My [first] rose 1000x600 shot by @me!"),
            "my rose shot by <usr>!"
        );
    }
}
