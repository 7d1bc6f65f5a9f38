//! Folding text for lexicon matching.
//!
//! Rules match against a folded view of the text: lowercase, with control and
//! zero-width characters removed. Each folded char remembers the byte range it
//! came from, so the matcher and the masker agree on spans in the original.

/// ZWSP, ZWNJ, ZWJ, word joiner, BOM.
const ZERO_WIDTH: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

fn ignorable(c: char) -> bool {
    c.is_control() || ZERO_WIDTH.contains(&c)
}

/// Folded form of `s` for case-insensitive matching.
pub fn for_rules(s: &str) -> String {
    s.chars()
        .filter(|c| !ignorable(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Folded chars of `s`, each paired with the `(start, end)` byte span it came from.
/// Line breaks and tabs fold to a single space so word boundaries survive.
pub fn normalized_chars_with_spans(s: &str) -> (Vec<char>, Vec<(usize, usize)>) {
    let mut chars = Vec::with_capacity(s.len());
    let mut spans = Vec::with_capacity(s.len());
    for (start, ch) in s.char_indices() {
        let span = (start, start + ch.len_utf8());
        if matches!(ch, '\n' | '\t' | '\r') {
            chars.push(' ');
            spans.push(span);
        } else if !ignorable(ch) {
            for lc in ch.to_lowercase() {
                chars.push(lc);
                spans.push(span);
            }
        }
    }
    (chars, spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_width_is_dropped() {
        assert_eq!(for_rules("Da\u{200B}mN"), "damn");
    }

    #[test]
    fn spans_point_back_into_original() {
        let s = "A\u{200B}b";
        let (chars, spans) = normalized_chars_with_spans(s);
        assert_eq!(chars, vec!['a', 'b']);
        assert_eq!(spans, vec![(0, 1), (4, 5)]);
    }

    #[test]
    fn line_breaks_keep_word_boundaries() {
        let (chars, _) = normalized_chars_with_spans("old\nrope");
        assert_eq!(chars.iter().collect::<String>(), "old rope");
    }
}
