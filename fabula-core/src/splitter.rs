//! Response splitting and narration cleanup.
//!
//! The model is asked to end its narration with a marker and append the
//! change-list tags after it. Models being models, the marker is sometimes
//! missing, bracketed differently, or the tags leak into the prose; the
//! splitter recovers what it can and never fails.

use tracing::warn;

/// Marker the prompt contract asks the model to emit between narration and
/// the change list. Matched case-insensitively, with or without brackets.
pub const END_NARRATION_MARKER: &str = "END_NARRATION";

/// A raw response separated into its two segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResponse {
    /// Cleaned narration text.
    pub narration: String,
    /// Raw change-list text, possibly empty.
    pub change_list: String,
}

/// Split a raw model response into narration and change-list text.
///
/// Total: any input produces a result. A response with no tags at all is a
/// valid turn that changes nothing.
pub fn split_response(raw: &str) -> SplitResponse {
    // Preferred path: the explicit end-of-narration marker.
    if let Some((before, after)) = split_at_marker(raw) {
        return SplitResponse {
            narration: sanitize_narration(before),
            change_list: after.trim().to_string(),
        };
    }

    // Degraded path: first paragraph break followed by a tag-open. The
    // response is usable but the model violated the marker contract.
    if let Some(idx) = find_tag_paragraph(raw) {
        warn!("response missing end-of-narration marker; splitting at first tag block");
        return SplitResponse {
            narration: sanitize_narration(&raw[..idx]),
            change_list: raw[idx..].trim().to_string(),
        };
    }

    SplitResponse {
        narration: sanitize_narration(raw),
        change_list: String::new(),
    }
}

/// ASCII case-insensitive substring search. The needle must be ASCII, which
/// keeps the returned byte offset valid in the original string.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Case-insensitive search for the marker, optionally bracketed.
fn split_at_marker(raw: &str) -> Option<(&str, &str)> {
    let pos = find_ascii_ci(raw, END_NARRATION_MARKER)?;

    let mut start = pos;
    let mut end = pos + END_NARRATION_MARKER.len();

    // Swallow surrounding brackets when present.
    if raw[..start].ends_with('[') && raw[end..].starts_with(']') {
        start -= 1;
        end += 1;
    }

    Some((&raw[..start], &raw[end..]))
}

/// Find the byte offset of the first `\n\n[` tag paragraph.
fn find_tag_paragraph(raw: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(rel) = raw[search_from..].find("\n\n") {
        let para_start = search_from + rel + 2;
        let rest = raw[para_start..].trim_start_matches(['\n', ' ']);
        if rest.starts_with('[') && looks_like_tag(rest) {
            return Some(search_from + rel);
        }
        search_from = para_start;
    }
    None
}

/// Whether text starting with `[` looks like a `[NAME: ...]` tag block.
fn looks_like_tag(text: &str) -> bool {
    let body = &text[1..];
    let mut saw_letter = false;
    for c in body.chars() {
        if c.is_alphanumeric() || c == '_' {
            saw_letter = true;
        } else {
            return saw_letter && c == ':';
        }
    }
    false
}

// ============================================================================
// Narration sanitation
// ============================================================================

/// Clean model prose for display and storage.
///
/// Every rewrite is an idempotent string transformation: running the
/// sanitizer twice yields the same text as running it once.
pub fn sanitize_narration(text: &str) -> String {
    let mut out = strip_code_fences(text);
    out = strip_tag_fragments(&out);
    out = deobfuscate_spaced_words(&out);
    out = normalize_quotes(&out);
    out = convert_line_breaks(&out);
    out = strip_html_markup(&out);
    out = strip_markup_in_dialogue(&out);
    out = strip_unmatched_emphasis(&out);
    out.trim().to_string()
}

/// Drop code-fence marker lines, keeping fenced content.
fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove residual `[NAME: ...]` fragments that leaked into the prose.
///
/// Quoted values inside a fragment may contain `]`, so the scan respects
/// quotes rather than stopping at the first bracket.
fn strip_tag_fragments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '[' {
            if let Some(end) = tag_fragment_end(&chars, i) {
                i = end + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// If a `[NAME: ...]` fragment starts at `start`, return the index of its
/// closing bracket.
fn tag_fragment_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    let mut saw_name = false;

    // Tag name then a colon.
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' {
            saw_name = true;
            i += 1;
        } else if c == ':' && saw_name {
            i += 1;
            break;
        } else {
            return None;
        }
    }
    if i >= chars.len() {
        return None;
    }

    // Body: scan to the matching unquoted `]`.
    let mut quote: Option<char> = None;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ']' => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

/// Rewrite `[a-b-c]` obfuscation back to `abc`.
fn deobfuscate_spaced_words(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '[' {
            if let Some((word, end)) = spaced_word_at(&chars, i) {
                out.push_str(&word);
                i = end + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// Match `[x-y-z]` (single letters joined by hyphens) starting at `start`.
fn spaced_word_at(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut word = String::new();
    let mut i = start + 1;
    let mut expect_letter = true;

    while i < chars.len() {
        let c = chars[i];
        if expect_letter {
            if c.is_alphabetic() {
                word.push(c);
                expect_letter = false;
            } else {
                return None;
            }
        } else if c == '-' {
            expect_letter = true;
        } else if c == ']' {
            // At least two joined letters, otherwise leave it alone.
            return (word.chars().count() >= 2).then_some((word, i));
        } else {
            return None;
        }
        i += 1;
    }
    None
}

/// Smart quotes and apostrophes to their straight equivalents.
fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' => '\'',
            other => other,
        })
        .collect()
}

/// Explicit `<br>`-style break markup to newlines.
fn convert_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = find_ascii_ci(rest, "<br") {
        let tail = &rest[pos..];
        if let Some(close) = tail.find('>') {
            let inner = &tail[3..close];
            if inner.trim().is_empty() || inner.trim() == "/" {
                out.push_str(&rest[..pos]);
                out.push('\n');
                rest = &tail[close + 1..];
                continue;
            }
        }
        out.push_str(&rest[..pos + 3]);
        rest = &tail[3..];
    }

    out.push_str(rest);
    out
}

/// Strip simple emphasis HTML tags (open or close) that leaked through.
fn strip_html_markup(text: &str) -> String {
    const TAGS: [&str; 8] = [
        "<i>", "</i>", "<em>", "</em>", "<b>", "</b>", "<strong>", "</strong>",
    ];
    let mut out = text.to_string();
    for tag in TAGS {
        while let Some(pos) = find_ascii_ci(&out, tag) {
            out.replace_range(pos..pos + tag.len(), "");
        }
    }
    out
}

/// Remove `*`/`_` emphasis characters inside double-quoted dialogue spans.
fn strip_markup_in_dialogue(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_dialogue = false;

    for c in text.chars() {
        if c == '"' {
            in_dialogue = !in_dialogue;
            out.push(c);
        } else if in_dialogue && (c == '*' || c == '_') {
            // dropped
        } else {
            out.push(c);
        }
    }

    out
}

/// Per line, drop the final `*` when emphasis markers are unbalanced.
fn strip_unmatched_emphasis(text: &str) -> String {
    text.lines()
        .map(|line| {
            let stars = line.chars().filter(|&c| c == '*').count();
            if stars % 2 == 1 {
                let mut cleaned = String::with_capacity(line.len());
                let mut dropped = false;
                for c in line.chars().rev() {
                    if c == '*' && !dropped {
                        dropped = true;
                    } else {
                        cleaned.push(c);
                    }
                }
                cleaned.chars().rev().collect()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_marker() {
        let raw = "The gate opens slowly.\n\n[END_NARRATION]\n[ITEM_ADD: name=Key, quantity=1]";
        let split = split_response(raw);
        assert_eq!(split.narration, "The gate opens slowly.");
        assert_eq!(split.change_list, "[ITEM_ADD: name=Key, quantity=1]");
    }

    #[test]
    fn test_split_marker_case_insensitive_unbracketed() {
        let raw = "Night falls.\nend_narration\n[TIME_ADVANCE: hours=8]";
        let split = split_response(raw);
        assert_eq!(split.narration, "Night falls.");
        assert_eq!(split.change_list, "[TIME_ADVANCE: hours=8]");
    }

    #[test]
    fn test_split_degraded_mode() {
        let raw = "You pick up the torch.\n\n[ITEM_ADD: name=Torch, quantity=1]";
        let split = split_response(raw);
        assert_eq!(split.narration, "You pick up the torch.");
        assert!(split.change_list.starts_with("[ITEM_ADD"));
    }

    #[test]
    fn test_split_no_tags_all_narration() {
        let raw = "Nothing happens. The room is silent.";
        let split = split_response(raw);
        assert_eq!(split.narration, raw);
        assert!(split.change_list.is_empty());
    }

    #[test]
    fn test_split_empty_input() {
        let split = split_response("");
        assert!(split.narration.is_empty());
        assert!(split.change_list.is_empty());
    }

    #[test]
    fn test_split_only_tags() {
        let raw = "[END_NARRATION]\n[MEMORY_ADD: content=\"quiet day\"]";
        let split = split_response(raw);
        assert!(split.narration.is_empty());
        assert!(split.change_list.contains("MEMORY_ADD"));
    }

    #[test]
    fn test_plain_paragraph_break_does_not_split() {
        let raw = "First paragraph.\n\nSecond paragraph, still narration.";
        let split = split_response(raw);
        assert!(split.change_list.is_empty());
        assert!(split.narration.contains("Second paragraph"));
    }

    #[test]
    fn test_sanitize_strips_code_fences() {
        let text = "```\nThe hidden text.\n```";
        assert_eq!(sanitize_narration(text), "The hidden text.");
    }

    #[test]
    fn test_sanitize_strips_leaked_tags() {
        let text = "You take the rope. [ITEM_ADD: name=\"Rope [50ft]\", quantity=1] It is heavy.";
        assert_eq!(sanitize_narration(text), "You take the rope.  It is heavy.");
    }

    #[test]
    fn test_sanitize_deobfuscates_spaced_words() {
        assert_eq!(sanitize_narration("The [d-r-a-g-o-n] roars."), "The dragon roars.");
    }

    #[test]
    fn test_sanitize_normalizes_smart_quotes() {
        let text = "\u{201C}Hello,\u{201D} she said. It\u{2019}s late.";
        assert_eq!(sanitize_narration(text), "\"Hello,\" she said. It's late.");
    }

    #[test]
    fn test_sanitize_converts_breaks() {
        assert_eq!(sanitize_narration("One.<br>Two.<br/>Three."), "One.\nTwo.\nThree.");
    }

    #[test]
    fn test_sanitize_strips_markup_in_dialogue() {
        let text = "\"*Leave*, now,\" he growled.";
        assert_eq!(sanitize_narration(text), "\"Leave, now,\" he growled.");
    }

    #[test]
    fn test_sanitize_strips_unmatched_emphasis() {
        assert_eq!(sanitize_narration("A cold wind.*"), "A cold wind.");
        assert_eq!(sanitize_narration("*emphasized* text"), "*emphasized* text");
    }

    #[test]
    fn test_sanitize_strips_html_emphasis() {
        assert_eq!(sanitize_narration("An <em>old</em> map."), "An old map.");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "```\nfence\n```\nThe [d-r-a-g-o-n] stirs. \u{201C}*Run*\u{201D}<br>[NPC_UPDATE: name=X] end.*",
            "Plain text with nothing to fix.",
            "\"Quoted _with_ markup\" and *balanced* stars.",
        ];
        for input in inputs {
            let once = sanitize_narration(input);
            let twice = sanitize_narration(&once);
            assert_eq!(once, twice, "sanitizer not idempotent for: {input}");
        }
    }
}
