// Flag token extraction from grading server responses.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("No flag found in the response")]
pub struct FlagNotFound;

/// Patterns tried in order; the first hit wins. All are case-insensitive and
/// let `.` cross line breaks.
static FLAG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)FLG:[A-Z0-9_]+",
        r"(?is)FLG:[ \n\r\t]*[A-Z0-9_]+",
        r"(?is)F[ \n\r\t]*L[ \n\r\t]*G[ \n\r\t]*:[ \n\r\t]*[A-Z0-9_]+",
        r"(?is)[Ff][Ll][Gg][ \n\r\t]*:[ \n\r\t]*[A-Z0-9_]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static flag pattern"))
    .collect()
});

static FLAG_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\n\r\t ]+").expect("static whitespace pattern"));

/// Find the first flag token in `text`, with embedded whitespace removed.
pub fn find_flag(text: &str) -> Result<String, FlagNotFound> {
    for (index, pattern) in FLAG_PATTERNS.iter().enumerate() {
        if let Some(m) = pattern.find(text) {
            let flag = FLAG_WHITESPACE.replace_all(m.as_str(), "").into_owned();
            debug!(pattern = index, %flag, "flag pattern matched");
            return Ok(flag);
        }
    }
    Err(FlagNotFound)
}

/// Like [`find_flag`], for callers where a missing flag is not an error.
pub fn scan_flag(text: &str) -> Option<String> {
    find_flag(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_flag() {
        assert_eq!(
            find_flag(r#"{"code":0,"message":"{{FLG:ABC_123}}"}"#).unwrap(),
            "FLG:ABC_123"
        );
    }

    #[test]
    fn whitespace_after_colon_is_removed() {
        assert_eq!(find_flag("wynik: FLG:  AB_12").unwrap(), "FLG:AB_12");
    }

    #[test]
    fn flag_split_across_lines() {
        assert_eq!(find_flag("F L G\n:\n  SECRET_9\nrest").unwrap(), "FLG:SECRET_9");
    }

    #[test]
    fn lowercase_prefix() {
        assert_eq!(find_flag("here: flg: NICE").unwrap(), "flg:NICE");
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(find_flag("FLG:FIRST and FLG:SECOND").unwrap(), "FLG:FIRST");
    }

    #[test]
    fn earlier_pattern_takes_priority_over_position() {
        // The compact form later in the text beats the spaced-out form
        // earlier in the text.
        assert_eq!(find_flag("F L G:SPACED then FLG:COMPACT").unwrap(), "FLG:COMPACT");
    }

    #[test]
    fn nothing_here_is_not_found() {
        assert_eq!(find_flag("nothing here"), Err(FlagNotFound));
        assert_eq!(FlagNotFound.to_string(), "No flag found in the response");
    }

    #[test]
    fn colon_without_token_is_not_a_flag() {
        assert!(scan_flag("FLG: ").is_none());
        assert!(scan_flag("").is_none());
    }
}
