//! Textual post-correction applied to raw OCR output.
//!
//! Pass order matters for idempotence:
//!
//! 1. Ambiguous-glyph substitution inside words of length ≥ 3 (`|→l`, …) —
//!    must run before the character whitelist strips the glyphs.
//! 2. Whitelist strip: everything outside letters, digits, basic
//!    punctuation, and whitespace is removed.
//! 3. Newline unification + whitespace-run collapse.
//! 4. Word-boundary typo correction, case-insensitive, casing preserved.
//!
//! Applying the whole chain twice equals applying it once: substitution
//! outputs are plain letters, corrections never produce correction inputs.

/// Misrecognized glyph → intended letter, applied only inside word runs.
const AMBIGUOUS_GLYPHS: &[(char, char)] = &[
    ('|', 'l'),
    ('§', 'S'),
    ('©', 'o'),
    ('¡', 'i'),
    ('€', 'e'),
];

/// Frequent OCR/typing confusions, matched on word boundaries.
const TYPO_CORRECTIONS: &[(&str, &str)] = &[
    ("teh", "the"),
    ("adn", "and"),
    ("taht", "that"),
    ("wiht", "with"),
    ("recieve", "receive"),
    ("thier", "their"),
];

const BASIC_PUNCTUATION: &str = ".,;:!?'\"()[]{}<>-_/\\@#%&*+=";

/// Run the full post-correction chain.
pub fn apply(text: &str) -> String {
    let substituted = substitute_ambiguous(text);
    let stripped = strip_non_whitelist(&substituted);
    let collapsed = collapse_whitespace(&stripped);
    correct_typos(&collapsed)
}

fn is_glyph_key(c: char) -> bool {
    AMBIGUOUS_GLYPHS.iter().any(|&(k, _)| k == c)
}

fn glyph_replacement(c: char) -> char {
    AMBIGUOUS_GLYPHS
        .iter()
        .find(|&&(k, _)| k == c)
        .map(|&(_, v)| v)
        .unwrap_or(c)
}

/// Substitute ambiguous glyphs, but only when they sit inside a word run
/// (alphanumerics plus glyph keys) of total length ≥ 3. `"he||o"` becomes
/// `"hello"`; a lone `"|"` is left for the whitelist to strip.
fn substitute_ambiguous(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || is_glyph_key(c) {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || is_glyph_key(chars[i])) {
                i += 1;
            }
            let run = &chars[start..i];
            if run.len() >= 3 {
                out.extend(run.iter().map(|&c| glyph_replacement(c)));
            } else {
                out.extend(run.iter());
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

fn strip_non_whitelist(text: &str) -> String {
    text.chars()
        .filter(|&c| c.is_alphanumeric() || c.is_whitespace() || BASIC_PUNCTUATION.contains(c))
        .collect()
}

/// Unify `\r\n`/`\r` to `\n`, then collapse each whitespace run to a single
/// character: one `\n` if the run contained a newline, one space otherwise.
fn collapse_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut run_has_newline = false;
    let mut in_run = false;
    for c in unified.chars() {
        if c.is_whitespace() {
            in_run = true;
            if c == '\n' {
                run_has_newline = true;
            }
        } else {
            if in_run {
                out.push(if run_has_newline { '\n' } else { ' ' });
                in_run = false;
                run_has_newline = false;
            }
            out.push(c);
        }
    }
    if in_run {
        out.push(if run_has_newline { '\n' } else { ' ' });
    }
    out.trim().to_string()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\''
}

fn correct_typos(text: &str) -> String {
    let mut out = text.to_string();
    for &(typo, fix) in TYPO_CORRECTIONS {
        out = replace_word_case_aware(&out, typo, fix);
    }
    out
}

/// Replace whole-word occurrences of `needle` (case-insensitive) with
/// `replacement`, carrying over the source casing pattern.
fn replace_word_case_aware(text: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() || text.is_empty() {
        return text.to_string();
    }

    let needle_lower = needle.to_ascii_lowercase();
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0usize;
    let mut changed = false;
    while i < chars.len() {
        let rem: String = chars[i..].iter().collect();
        if rem.to_ascii_lowercase().starts_with(&needle_lower) {
            let start_ok = i == 0 || !is_word_char(chars[i - 1]);
            let end_idx = i + needle.chars().count();
            let end_ok = end_idx >= chars.len() || !is_word_char(chars[end_idx]);
            if start_ok && end_ok {
                let source: String = chars[i..end_idx].iter().collect();
                out.push_str(&match_case(&source, replacement));
                i = end_idx;
                changed = true;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    if changed {
        out
    } else {
        text.to_string()
    }
}

fn match_case(source: &str, replacement: &str) -> String {
    if source.chars().all(|c| c.is_uppercase()) {
        replacement.to_ascii_uppercase()
    } else if source
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
    {
        let mut chars = replacement.chars();
        match chars.next() {
            Some(first) => format!("{}{}", first.to_ascii_uppercase(), chars.as_str()),
            None => replacement.to_string(),
        }
    } else {
        replacement.to_string()
    }
}
