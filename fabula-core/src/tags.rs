//! Change-list tag parser.
//!
//! The change list is a sequence of `[TAGNAME: key=value, key2="value"]`
//! blocks. The model's formatting is unreliable, so the parser is built to
//! salvage: a malformed block is logged and dropped, and parsing always
//! continues with the next block. Partial success is the normal case.

use std::collections::BTreeMap;
use tracing::warn;

/// A parsed tag parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view. A quoted number (`quantity="3"`) is stored as a string
    /// but still counts here, since the model quotes inconsistently.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Num(n) => Some(*n),
            TagValue::Str(s) if is_number_literal(s.trim()) => s.trim().parse().ok(),
            TagValue::Str(_) | TagValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|n| n.round() as i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Render any value back to text. Useful for fields that accept either
    /// quoted strings or bare words.
    pub fn to_text(&self) -> String {
        match self {
            TagValue::Str(s) => s.clone(),
            TagValue::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            TagValue::Bool(b) => b.to_string(),
        }
    }
}

/// One parsed, typed instruction extracted from the change list.
///
/// Transient: consumed once by the dispatcher, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Tag name, upper-cased.
    pub kind: String,
    pub fields: BTreeMap<String, TagValue>,
}

impl ChangeRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into().to_uppercase(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: TagValue) -> Self {
        self.fields.insert(key.into().to_lowercase(), value);
        self
    }

    /// String field, accepting numbers and booleans rendered as text.
    pub fn text_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(TagValue::to_text)
    }

    pub fn num_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key)?.as_f64()
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.fields.get(key)?.as_i64()
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.fields.get(key)?.as_bool()
    }
}

/// Parse change-list text into the ordered list of records.
///
/// Total: never fails for any input. Ordering matches appearance order
/// because later records may depend on earlier ones within the same turn.
pub fn parse_change_list(text: &str) -> Vec<ChangeRecord> {
    let chars: Vec<char> = text.chars().collect();
    let mut records = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '[' {
            i += 1;
            continue;
        }
        match parse_block(&chars, i) {
            Ok((record, end)) => {
                records.push(record);
                i = end + 1;
            }
            Err(reason) => {
                let preview: String = chars[i..].iter().take(40).collect();
                warn!("dropping malformed tag block ({reason}): {preview}...");
                i += 1;
            }
        }
    }

    records
}

/// Parse one `[NAME: body]` block starting at `start` (which is `[`).
/// Returns the record and the index of the closing `]`.
fn parse_block(chars: &[char], start: usize) -> Result<(ChangeRecord, usize), String> {
    let mut i = start + 1;

    // Tag name.
    let name_start = i;
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    if i == name_start {
        return Err("missing tag name".to_string());
    }
    let name: String = chars[name_start..i].iter().collect();

    skip_spaces(chars, &mut i);
    if i >= chars.len() || chars[i] != ':' {
        return Err("missing ':' after tag name".to_string());
    }
    i += 1;

    let mut record = ChangeRecord::new(name);

    loop {
        skip_whitespace(chars, &mut i);
        if i >= chars.len() {
            return Err("unterminated block".to_string());
        }
        if chars[i] == ']' {
            return Ok((record, i));
        }

        // Key.
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && chars[i] != ']' && chars[i] != ',' {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            return Err("key without '='".to_string());
        }
        let key: String = chars[key_start..i].iter().collect::<String>().trim().to_lowercase();
        if key.is_empty() {
            return Err("empty key".to_string());
        }
        i += 1;

        // Value.
        skip_spaces(chars, &mut i);
        let value = if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            let quote = chars[i];
            i += 1;
            let val_start = i;
            // Greedy to the matching quote: brackets and commas inside are
            // plain content.
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated quoted value".to_string());
            }
            let raw: String = chars[val_start..i].iter().collect();
            i += 1;
            TagValue::Str(raw)
        } else {
            let val_start = i;
            while i < chars.len() && chars[i] != ',' && chars[i] != ']' && chars[i] != '\n' {
                i += 1;
            }
            let raw: String = chars[val_start..i].iter().collect::<String>().trim().to_string();
            coerce_bare(&raw)
        };

        record.fields.insert(key, value);

        // Separator: ',' (or a newline acting as one) continues, ']' ends.
        skip_whitespace(chars, &mut i);
        if i >= chars.len() {
            return Err("unterminated block".to_string());
        }
        if chars[i] == ',' {
            i += 1;
        }
    }
}

fn skip_spaces(chars: &[char], i: &mut usize) {
    while *i < chars.len() && (chars[*i] == ' ' || chars[*i] == '\t') {
        *i += 1;
    }
}

fn skip_whitespace(chars: &[char], i: &mut usize) {
    while *i < chars.len() && chars[*i].is_whitespace() {
        *i += 1;
    }
}

/// Coerce a bare value: numbers and booleans, otherwise a string.
fn coerce_bare(raw: &str) -> TagValue {
    if raw.eq_ignore_ascii_case("true") {
        return TagValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return TagValue::Bool(false);
    }
    if is_number_literal(raw) {
        if let Ok(n) = raw.parse::<f64>() {
            return TagValue::Num(n);
        }
    }
    TagValue::Str(raw.to_string())
}

/// Strict integer/decimal pattern: optional sign, digits, optional single
/// fractional part. Rejects `parse::<f64>` extras like `inf` and `1e9`.
fn is_number_literal(raw: &str) -> bool {
    let s = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if s.is_empty() {
        return false;
    }
    let mut dots = 0;
    let mut digits = 0;
    for c in s.chars() {
        if c == '.' {
            dots += 1;
            if dots > 1 {
                return false;
            }
        } else if c.is_ascii_digit() {
            digits += 1;
        } else {
            return false;
        }
    }
    digits > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_block() {
        let records = parse_change_list("[ITEM_ADD: name=Torch, quantity=2]");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "ITEM_ADD");
        assert_eq!(records[0].text_field("name").as_deref(), Some("Torch"));
        assert_eq!(records[0].int_field("quantity"), Some(2));
    }

    #[test]
    fn test_tag_name_upper_cased() {
        let records = parse_change_list("[item_add: name=Rope, quantity=1]");
        assert_eq!(records[0].kind, "ITEM_ADD");
    }

    #[test]
    fn test_value_coercion() {
        let records =
            parse_change_list("[STAT_UPDATE: name=Mana, value=12.5, max=50, depleted=false]");
        let r = &records[0];
        assert_eq!(r.num_field("value"), Some(12.5));
        assert_eq!(r.num_field("max"), Some(50.0));
        assert_eq!(r.bool_field("depleted"), Some(false));
    }

    #[test]
    fn test_quoted_value_stays_string() {
        let records = parse_change_list("[ITEM_ADD: name=\"42\", quantity=1]");
        assert_eq!(
            records[0].fields.get("name"),
            Some(&TagValue::Str("42".to_string()))
        );
    }

    #[test]
    fn test_quoted_number_readable_as_number() {
        let records = parse_change_list("[ITEM_ADD: name=Torch, quantity=\"3\"]");
        assert_eq!(records[0].int_field("quantity"), Some(3));

        let records = parse_change_list("[STAT_UPDATE: name=Mana, value=\"12.5\"]");
        assert_eq!(records[0].num_field("value"), Some(12.5));

        // Non-numeric strings still refuse the numeric view.
        let records = parse_change_list("[ITEM_ADD: name=Torch, quantity=\"a few\"]");
        assert_eq!(records[0].int_field("quantity"), None);
    }

    #[test]
    fn test_single_quoted_value() {
        let records = parse_change_list("[NPC_UPDATE: name='Old Man Harrow']");
        assert_eq!(records[0].text_field("name").as_deref(), Some("Old Man Harrow"));
    }

    #[test]
    fn test_nested_brackets_in_quoted_value() {
        let records =
            parse_change_list("[ITEM_ADD: name=\"Map [annotated]\", description=\"a, b, c\", quantity=1]");
        let r = &records[0];
        assert_eq!(r.text_field("name").as_deref(), Some("Map [annotated]"));
        assert_eq!(r.text_field("description").as_deref(), Some("a, b, c"));
    }

    #[test]
    fn test_multiple_blocks_in_order() {
        let text = "[ITEM_ADD: name=Torch, quantity=1]\n[ITEM_REMOVE: name=Torch, quantity=1]";
        let records = parse_change_list(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "ITEM_ADD");
        assert_eq!(records[1].kind, "ITEM_REMOVE");
    }

    #[test]
    fn test_malformed_block_dropped_others_survive() {
        let text = "[BROKEN name=oops]\n[QUEST_UPDATE: name=Rescue, status=completed]";
        let records = parse_change_list(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "QUEST_UPDATE");
    }

    #[test]
    fn test_unterminated_quote_dropped() {
        let text = "[ITEM_ADD: name=\"Torch, quantity=2]\n[TIME_ADVANCE: hours=1]";
        let records = parse_change_list(text);
        // The unterminated quote swallows the rest of its block; the later
        // block must still parse.
        assert!(records.iter().any(|r| r.kind == "TIME_ADVANCE"));
    }

    #[test]
    fn test_totality_on_garbage() {
        for input in ["", "[", "]", "[[[:::]]]", "no tags at all", "[: =,]"] {
            let _ = parse_change_list(input);
        }
    }

    #[test]
    fn test_bare_value_with_spaces() {
        let records = parse_change_list("[NPC_UPDATE: name=Captain Reyes, thoughts=wary]");
        assert_eq!(records[0].text_field("name").as_deref(), Some("Captain Reyes"));
    }

    #[test]
    fn test_negative_and_signed_numbers() {
        let records = parse_change_list("[REPUTATION_CHANGE: amount=-15]");
        assert_eq!(records[0].int_field("amount"), Some(-15));

        let records = parse_change_list("[REPUTATION_CHANGE: amount=+10]");
        assert_eq!(records[0].int_field("amount"), Some(10));
    }

    #[test]
    fn test_number_literal_rejects_exotics() {
        assert!(!is_number_literal("inf"));
        assert!(!is_number_literal("1e9"));
        assert!(!is_number_literal("1.2.3"));
        assert!(!is_number_literal("-"));
        assert!(is_number_literal("-3.5"));
        assert!(is_number_literal("007"));
    }

    #[test]
    fn test_multiline_block() {
        let text = "[QUEST_UPDATE: name=Rescue,\n status=in-progress,\n description=\"Find the miller's son\"]";
        let records = parse_change_list(text);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].text_field("description").as_deref(),
            Some("Find the miller's son")
        );
    }
}
