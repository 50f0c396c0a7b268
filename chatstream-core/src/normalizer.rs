use unicode_normalization::UnicodeNormalization;

/// Clean user input before it enters history:
/// Unicode NFC normalization + CRLF -> LF + trim of whitespace and BOMs.
/// Returns `None` when nothing is left to send.
pub fn normalize_input(s: &str) -> Option<String> {
    let mut t = s.nfc().collect::<String>();
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    let t = t.trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}');
    if t.is_empty() { None } else { Some(t.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_drops_empty() {
        assert_eq!(normalize_input("  Hello world   ").as_deref(), Some("Hello world"));
        assert_eq!(normalize_input(" \n\t "), None);
        assert_eq!(normalize_input("\u{FEFF}"), None);
    }

    #[test]
    fn unicode_nfc_and_crlf_normalization() {
        // "e" + combining acute accent should normalize to "é"
        assert_eq!(normalize_input("e\u{301}").as_deref(), Some("é"));
        assert_eq!(normalize_input("line1\r\nline2").as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn strips_byte_order_mark() {
        assert_eq!(normalize_input("\u{FEFF}hi").as_deref(), Some("hi"));
    }

    #[test]
    fn bom_after_leading_whitespace_is_still_empty() {
        assert_eq!(normalize_input(" \u{FEFF}\n "), None);
        assert_eq!(normalize_input("\t\u{FEFF} hi \u{FEFF}").as_deref(), Some("hi"));
    }
}
