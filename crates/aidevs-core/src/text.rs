// Text normalization helpers shared by the tasks.

use once_cell::sync::Lazy;
use regex::Regex;

static UNICODE_SPACES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{00A0}\u{1680}\u{2000}-\u{200A}\u{2028}\u{2029}\u{202F}\u{205F}\u{3000}]")
        .expect("static unicode space pattern")
});

/// A line that ends in what looks like the beginning of a URL or flag.
static BROKEN_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:https?:/?/?|FLG:?|FLAG:?)$").expect("static tail pattern"));

/// A line that starts with a plausible URL or token continuation.
static CONTINUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/?[A-Za-z0-9_.~:/?#\[\]@!$&'()*+,;=]+").expect("static continuation pattern")
});

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s'"<>]+"#).expect("static url pattern"));

/// Normalize `text` so that flags and URLs can be found with plain regexes.
///
/// Line endings become `\n`, HTML entities are decoded, exotic Unicode
/// spaces become ASCII spaces, and a URL or flag prefix dangling at the end
/// of a line is glued to the following line (which is left empty).
pub fn prepare_text_for_search(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Decode until nothing changes so that doubly escaped input settles.
    let mut text = text.to_string();
    loop {
        let decoded = html_escape::decode_html_entities(&text)
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        if decoded == text {
            break;
        }
        text = decoded;
    }
    let text = UNICODE_SPACES.replace_all(&text, " ");

    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    for i in 0..lines.len().saturating_sub(1) {
        if BROKEN_TAIL.is_match(&lines[i]) && CONTINUATION.is_match(&lines[i + 1]) {
            let next = std::mem::take(&mut lines[i + 1]);
            lines[i].push_str(&next);
        }
    }

    lines.join("\n")
}

/// First http(s) URL in `text`.
pub fn find_url(text: &str) -> Option<&str> {
    URL.find(text).map(|m| m.as_str())
}

/// Every http(s) URL in `text`, in order of appearance.
pub fn find_urls(text: &str) -> Vec<&str> {
    URL.find_iter(text).map(|m| m.as_str()).collect()
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(text: &str) -> &str {
    let mut t = text.trim();
    if let Some(rest) = t.strip_prefix("```") {
        t = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("sql"))
            .unwrap_or(rest);
    }
    if let Some(rest) = t.strip_suffix("```") {
        t = rest;
    }
    t.trim()
}

/// Upper-case `name` and fold Polish (and other Latin) diacritics to ASCII.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .flat_map(char::to_uppercase)
        .map(fold_diacritic)
        .collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'Ą' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => 'A',
        'Ć' | 'Č' | 'Ç' => 'C',
        'Ę' | 'É' | 'È' | 'Ê' | 'Ë' | 'Ě' => 'E',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'Ł' => 'L',
        'Ń' | 'Ñ' | 'Ň' => 'N',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'Ś' | 'Š' => 'S',
        'Ú' | 'Ù' | 'Û' | 'Ü' | 'Ů' => 'U',
        'Ý' => 'Y',
        'Ź' | 'Ż' | 'Ž' => 'Z',
        other => other,
    }
}

/// True when `name` is non-empty and consists only of `A`-`Z`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase())
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(prepare_text_for_search(""), "");
    }

    #[test]
    fn normalizes_line_endings() {
        assert_eq!(prepare_text_for_search("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn decodes_entities_and_spaces() {
        let text = "Flaga&nbsp;to&#58; FLG&#58;X\u{2003}y &amp; z\u{3000}!";
        assert_eq!(
            prepare_text_for_search(text),
            "Flaga to: FLG:X y & z !"
        );
    }

    #[test]
    fn joins_broken_url() {
        let text = "see https://\nexample.com/path and more\nnext";
        assert_eq!(
            prepare_text_for_search(text),
            "see https://example.com/path and more\n\nnext"
        );
    }

    #[test]
    fn joins_broken_flag() {
        let text = "flag is FLG:\nABC_12\n";
        assert_eq!(prepare_text_for_search(text), "flag is FLG:ABC_12\n\n");
    }

    #[test]
    fn does_not_join_regular_lines() {
        let text = "first line\nsecond line";
        assert_eq!(prepare_text_for_search(text), text);
    }

    #[test]
    fn idempotent_on_realistic_inputs() {
        let samples = [
            "",
            "plain text",
            "see https://\nexample.com/x\nFLG:\nTOKEN\r\nend",
            "&lt;p&gt;FLG&#58;&nbsp;ABC&lt;/p&gt;\r\n",
            "a\u{00A0}b\u{2028}c\u{205F}d",
            "http:/\n/host/path\nflag:\n",
            "kod: &amp;lt;FLG&amp;gt;",
            "&amp;amp;nbsp; &amp;#13;x",
        ];
        for sample in samples {
            let once = prepare_text_for_search(sample);
            let twice = prepare_text_for_search(&once);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn doubly_escaped_entities_are_fully_decoded() {
        assert_eq!(prepare_text_for_search("kod: &amp;lt;FLG&amp;gt;"), "kod: <FLG>");
        assert_eq!(prepare_text_for_search("a &amp;amp; b"), "a & b");
    }

    #[test]
    fn finds_urls() {
        let text = "Pobierz z https://a.example/x.txt lub 'http://b.example/y?z=1'.";
        assert_eq!(find_url(text), Some("https://a.example/x.txt"));
        assert_eq!(
            find_urls(text),
            vec!["https://a.example/x.txt", "http://b.example/y?z=1"]
        );
        assert_eq!(find_url("brak"), None);
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```sql\nSELECT 1;\n```"), "SELECT 1;");
        assert_eq!(strip_code_fences("```\nx\n```"), "x");
        assert_eq!(strip_code_fences("  bare  "), "bare");
    }

    #[test]
    fn normalizes_polish_names() {
        assert_eq!(normalize_name("Rafał"), "RAFAL");
        assert_eq!(normalize_name(" Kraków "), "KRAKOW");
        assert_eq!(normalize_name("Łódź"), "LODZ");
        assert_eq!(normalize_name("Gdańsk"), "GDANSK");
        assert!(is_valid_name(&normalize_name("Zażółć")));
    }

    #[test]
    fn validates_names() {
        assert!(is_valid_name("BARBARA"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("[**RESTRICTED"));
        assert!(!is_valid_name("BARBARA2"));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_chars("zażółć", 3), "zaż");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
