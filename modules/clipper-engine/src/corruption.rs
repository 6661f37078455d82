//! Content-corruption detection.
//!
//! A pure predicate over extracted text, independent of any network I/O, so
//! the validator and the extractor can both call it and it unit-tests in
//! isolation. Tuned to tolerate accented and symbol-heavy but legitimate
//! text: separators, horizontal rules and zero-width formatting never trip
//! the repeated-run scan.

use crate::policy::corruption as policy;

/// Zero-width and BOM-ish formatting characters that appear in legitimate
/// CMS output and must never count as corruption.
const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Decide whether a block of extracted text is mangled beyond use:
/// encoding damage, binary bleed-through, or a parser stuck in a loop.
pub fn is_corrupted(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < policy::MIN_SAMPLE_CHARS {
        return false;
    }

    if replacement_char_count(&chars) > policy::MAX_REPLACEMENT_CHARS {
        return true;
    }

    if has_control_run(&chars) {
        return true;
    }

    if non_ascii_ratio(&chars) > policy::MAX_NON_ASCII_RATIO {
        return true;
    }

    if word_token_ratio(text) < policy::MIN_WORD_RATIO {
        return true;
    }

    has_suspicious_repeat_run(&chars)
}

fn replacement_char_count(chars: &[char]) -> usize {
    chars.iter().filter(|&&c| c == '\u{FFFD}').count()
}

/// A run of control characters (excluding \n \r \t) longer than the policy
/// cap means binary data leaked into the text.
fn has_control_run(chars: &[char]) -> bool {
    let mut run = 0usize;
    for &c in chars {
        if c.is_control() && c != '\n' && c != '\r' && c != '\t' {
            run += 1;
            if run > policy::MAX_CONTROL_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Ratio of non-ASCII to total non-whitespace characters. Zero-width
/// formatting characters are excluded from the numerator: they are invisible
/// styling, not damage.
fn non_ascii_ratio(chars: &[char]) -> f32 {
    let mut total = 0usize;
    let mut non_ascii = 0usize;
    for &c in chars {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if !c.is_ascii() && !ZERO_WIDTH.contains(&c) {
            non_ascii += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    non_ascii as f32 / total as f32
}

/// Fraction of whitespace-separated tokens that contain at least one
/// alphabetic character. Genuine prose is mostly words; corrupted output is
/// mostly symbol soup.
fn word_token_ratio(text: &str) -> f32 {
    let mut total = 0usize;
    let mut words = 0usize;
    for token in text.split_whitespace() {
        total += 1;
        if token.chars().any(|c| c.is_alphabetic()) {
            words += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    words as f32 / total as f32
}

/// True when `c` is acceptable inside a legitimately repeated unit:
/// separators, list bullets, rule characters, brackets, whitespace and
/// zero-width formatting. A run made only of these is layout, not damage.
fn is_separator_char(c: char) -> bool {
    c.is_whitespace()
        || ZERO_WIDTH.contains(&c)
        || matches!(
            c,
            '-' | '=' | '_' | '*' | '~' | '|' | '•' | '·' | '.' | ','
                | ':' | ';' | '#' | '+' | '<' | '>' | '/' | '\\'
                | '[' | ']' | '(' | ')' | '{' | '}' | '\'' | '"' | '`'
        )
}

/// Context-aware repeated-run scan: a short unit repeated back-to-back at
/// least `MIN_REPEAT_RUN` times is corruption unless the whole run is made
/// of separator/formatting characters. Catches extractor loops emitting the
/// same fragment over and over while leaving `------`, `* * *` and `[][][]`
/// alone.
fn has_suspicious_repeat_run(chars: &[char]) -> bool {
    let n = chars.len();
    for unit_len in 1..=4usize {
        if n < unit_len * policy::MIN_REPEAT_RUN {
            continue;
        }
        let mut i = 0;
        while i + unit_len * policy::MIN_REPEAT_RUN <= n {
            let unit = &chars[i..i + unit_len];
            let mut repeats = 1;
            let mut j = i + unit_len;
            while j + unit_len <= n && &chars[j..j + unit_len] == unit {
                repeats += 1;
                j += unit_len;
            }
            if repeats >= policy::MIN_REPEAT_RUN {
                if !unit.iter().all(|&c| is_separator_char(c)) {
                    return true;
                }
                i = j;
            } else {
                i += 1;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILLER: &str = "The city council voted on the new transit plan \
        after a long public comment period on Tuesday evening.";

    #[test]
    fn clean_english_prose_passes() {
        assert!(!is_corrupted(FILLER));
    }

    #[test]
    fn short_text_is_never_judged() {
        assert!(!is_corrupted("����"));
    }

    #[test]
    fn accented_text_passes() {
        let text = "El concejo municipal votó el martes sobre el nuevo plan \
            de tránsito después de un largo período de comentarios públicos.";
        assert!(!is_corrupted(text));
    }

    #[test]
    fn replacement_characters_fail() {
        let text = format!("{FILLER} \u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}");
        assert!(is_corrupted(&text));
    }

    #[test]
    fn control_run_fails() {
        let text = format!("{FILLER}\u{1}\u{2}\u{3}\u{4}\u{5} more text");
        assert!(is_corrupted(&text));
    }

    #[test]
    fn mojibake_heavy_text_fails() {
        // Double-decoded UTF-8 turns every accent into 2-3 high-byte chars.
        let text = "Ã©Ã¨Ã§Ã Ã¹Ã»Ã®Ã¯Ã´Ã¶ Ã©Ã¨Ã§Ã Ã¹Ã»Ã®Ã¯Ã´Ã¶ \
            Ã©Ã¨Ã§Ã Ã¹Ã»Ã®Ã¯Ã´Ã¶ Ã©Ã¨Ã§Ã Ã¹Ã»Ã®Ã¯Ã´Ã¶";
        assert!(is_corrupted(text));
    }

    #[test]
    fn symbol_soup_fails_word_ratio() {
        let text = "=+= #### 123 456 !!! ??? 789 $$$ %%% 000 ^^^ &&& 111 \
            @@@ ~~~ 222 ||| ::: 333 ... 444";
        assert!(is_corrupted(text));
    }

    #[test]
    fn repeated_separator_run_is_legitimate() {
        // "[]" repeated past the run threshold is a separator, not corruption.
        let text = format!("{FILLER} [][][][][][][][][][][] {FILLER}");
        assert!(!is_corrupted(&text));
    }

    #[test]
    fn horizontal_rules_are_legitimate() {
        let text = format!("{FILLER}\n--------------------\n{FILLER}");
        assert!(!is_corrupted(&text));
        let text = format!("{FILLER}\n* * * * * * * * * *\n{FILLER}");
        assert!(!is_corrupted(&text));
    }

    #[test]
    fn repeated_word_fragment_fails() {
        let text = format!("{FILLER} {}", "adad".repeat(12));
        assert!(is_corrupted(&text));
    }

    #[test]
    fn zero_width_characters_are_ignored() {
        let padded: String = FILLER
            .chars()
            .flat_map(|c| [c, '\u{200B}'])
            .collect();
        assert!(!is_corrupted(&padded));
    }
}
