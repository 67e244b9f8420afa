//! Splitting text into contiguous units.
//!
//! Every function here returns units whose byte ranges tile the input range
//! exactly: no gaps, no overlaps, separators stay attached to the piece they
//! terminate. Packing units into chunks therefore never loses a character.

/// A contiguous byte range of the source text plus its length in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unit {
    pub start: usize,
    pub end: usize,
    pub chars: usize,
}

impl Unit {
    pub fn new(text: &str, start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            chars: text[start..end].chars().count(),
        }
    }
}

/// Separators tried in order by the recursive strategy. The empty separator
/// means "split into characters".
pub(crate) const RECURSIVE_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", ", ", " ", ""];

pub(crate) fn char_units(text: &str, start: usize, end: usize) -> Vec<Unit> {
    text[start..end]
        .char_indices()
        .map(|(i, c)| Unit {
            start: start + i,
            end: start + i + c.len_utf8(),
            chars: 1,
        })
        .collect()
}

/// Split `text[start..end]` after every occurrence of `sep`.
pub(crate) fn split_after(text: &str, start: usize, end: usize, sep: &str) -> Vec<Unit> {
    let slice = &text[start..end];
    let mut units = Vec::new();
    let mut piece_start = 0;
    for (pos, _) in slice.match_indices(sep) {
        let piece_end = pos + sep.len();
        if piece_end > piece_start {
            units.push(Unit::new(text, start + piece_start, start + piece_end));
        }
        piece_start = piece_end;
    }
    if piece_start < slice.len() {
        units.push(Unit::new(text, start + piece_start, end));
    }
    units
}

/// Sentences end at `.`, `!` or `?` followed by whitespace, or at a blank
/// line. Trailing whitespace belongs to the sentence it follows.
pub(crate) fn sentence_units(text: &str, start: usize, end: usize) -> Vec<Unit> {
    let slice = &text[start..end];
    let mut units = Vec::new();
    let mut piece_start = 0;
    let mut chars = slice.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '.' | '!' | '?' => chars.peek().is_some_and(|&(_, n)| n.is_whitespace()),
            '\n' => chars.peek().is_some_and(|&(_, n)| n == '\n'),
            _ => false,
        };
        if !boundary {
            continue;
        }
        let mut cut = i + c.len_utf8();
        while let Some(&(j, n)) = chars.peek() {
            if !n.is_whitespace() {
                break;
            }
            cut = j + n.len_utf8();
            chars.next();
        }
        units.push(Unit::new(text, start + piece_start, start + cut));
        piece_start = cut;
    }
    if piece_start < slice.len() {
        units.push(Unit::new(text, start + piece_start, end));
    }
    units
}

/// A word plus the whitespace after it. Leading whitespace joins the first word.
pub(crate) fn word_units(text: &str, start: usize, end: usize) -> Vec<Unit> {
    let slice = &text[start..end];
    let mut units = Vec::new();
    let mut piece_start = 0;
    let mut in_space = false;
    let mut seen_word = false;

    for (i, c) in slice.char_indices() {
        if c.is_whitespace() {
            in_space = true;
            continue;
        }
        if in_space && seen_word {
            units.push(Unit::new(text, start + piece_start, start + i));
            piece_start = i;
        }
        in_space = false;
        seen_word = true;
    }
    if piece_start < slice.len() {
        units.push(Unit::new(text, start + piece_start, end));
    }
    units
}

pub(crate) fn paragraph_units(text: &str, start: usize, end: usize) -> Vec<Unit> {
    split_after(text, start, end, "\n\n")
}

/// Structure-aware splitting: try the coarsest separator present, and only
/// descend to finer separators for pieces that are still too long.
pub(crate) fn recursive_units(
    text: &str,
    start: usize,
    end: usize,
    separators: &[&str],
    size: usize,
) -> Vec<Unit> {
    if start == end {
        return Vec::new();
    }
    let whole = Unit::new(text, start, end);
    if whole.chars <= size {
        return vec![whole];
    }
    let slice = &text[start..end];
    let Some(pos) = separators
        .iter()
        .position(|s| s.is_empty() || slice.contains(s))
    else {
        return vec![whole];
    };
    let sep = separators[pos];
    if sep.is_empty() {
        return char_units(text, start, end);
    }
    let finer = &separators[pos + 1..];

    let mut out = Vec::new();
    for piece in split_after(text, start, end, sep) {
        if piece.chars <= size {
            out.push(piece);
        } else {
            out.extend(recursive_units(text, piece.start, piece.end, finer, size));
        }
    }
    out
}

/// Replace units longer than `size` by their words. Words that are still
/// too long are left whole.
pub(crate) fn refine_oversized(text: &str, units: Vec<Unit>, size: usize) -> Vec<Unit> {
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        if unit.chars > size {
            out.extend(word_units(text, unit.start, unit.end));
        } else {
            out.push(unit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(text: &str, units: &[Unit]) {
        let mut pos = 0;
        for u in units {
            assert_eq!(u.start, pos, "gap or overlap at {}", pos);
            assert!(u.end > u.start);
            pos = u.end;
        }
        assert_eq!(pos, text.len());
    }

    #[test]
    fn test_split_after_keeps_separator() {
        let text = "a\n\nb\n\n\n\nc";
        let units = split_after(text, 0, text.len(), "\n\n");
        let pieces: Vec<&str> = units.iter().map(|u| &text[u.start..u.end]).collect();
        assert_eq!(pieces, vec!["a\n\n", "b\n\n", "\n\n", "c"]);
        assert_tiles(text, &units);
    }

    #[test]
    fn test_sentence_units() {
        let text = "One. Two!  Three? Four";
        let units = sentence_units(text, 0, text.len());
        let pieces: Vec<&str> = units.iter().map(|u| &text[u.start..u.end]).collect();
        assert_eq!(pieces, vec!["One. ", "Two!  ", "Three? ", "Four"]);
    }

    #[test]
    fn test_sentence_units_decimal_not_split() {
        let text = "Pi is 3.14 roughly. Yes.";
        let units = sentence_units(text, 0, text.len());
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_word_units_leading_space() {
        let text = "  hello big world ";
        let units = word_units(text, 0, text.len());
        let pieces: Vec<&str> = units.iter().map(|u| &text[u.start..u.end]).collect();
        assert_eq!(pieces, vec!["  hello ", "big ", "world "]);
        assert_tiles(text, &units);
    }

    #[test]
    fn test_recursive_units_respect_size() {
        let text = "alpha beta gamma delta.\n\nepsilon zeta eta theta iota kappa lambda";
        let units = recursive_units(text, 0, text.len(), RECURSIVE_SEPARATORS, 12);
        assert_tiles(text, &units);
        assert!(units.iter().all(|u| u.chars <= 12));
    }

    #[test]
    fn test_recursive_units_empty_range() {
        assert!(recursive_units("", 0, 0, RECURSIVE_SEPARATORS, 10).is_empty());
        assert!(recursive_units("abc", 2, 2, RECURSIVE_SEPARATORS, 10).is_empty());
    }

    #[test]
    fn test_char_units_multibyte() {
        let text = "héllo→";
        let units = char_units(text, 0, text.len());
        assert_eq!(units.len(), 6);
        assert_tiles(text, &units);
    }
}
