//! Best-effort decoding of JSON text that is still being streamed.
//!
//! Tool-call arguments arrive from the model a few characters at a time. The
//! session re-parses the whole accumulated text after every delta, so the
//! decoder must return the most complete value derivable from any prefix of a
//! valid document. Unterminated objects and arrays are closed implicitly.
//!
//! Two modes control what happens to the scalar that was cut off by the end of
//! input:
//! - [`Truncation::Keep`] returns it as far as it got (`"Hel` becomes `"Hel"`),
//!   which suits text that is shown to a user while it is being typed.
//! - [`Truncation::Drop`] omits it together with its key, so every scalar in
//!   the result is final. Ids and zones must never be acted on half-written.

use serde_json::{Map, Value};

/// Nesting deeper than this is cut off, matching serde_json's own limit.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    Keep,
    Drop,
}

/// Decode `text`, keeping a truncated trailing scalar.
pub fn parse_partial(text: &str) -> Option<Value> {
    parse_with(text, Truncation::Keep)
}

/// Decode `text`, dropping a truncated trailing scalar.
pub fn parse_settled(text: &str) -> Option<Value> {
    parse_with(text, Truncation::Drop)
}

pub fn parse_with(text: &str, mode: Truncation) -> Option<Value> {
    let mut parser = Parser {
        src: text,
        bytes: text.as_bytes(),
        pos: 0,
        depth: 0,
        mode,
    };
    match parser.value() {
        Step::Done(value) => Some(value),
        Step::Cut(value) => value,
    }
}

enum Step {
    /// The value was fully written.
    Done(Value),
    /// Input ended (or turned invalid) inside the value.
    Cut(Option<Value>),
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
    mode: Truncation,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\n' | b'\r' | b'\t')) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Step {
        self.skip_ws();
        match self.peek() {
            None => Step::Cut(None),
            Some(b'{' | b'[') if self.depth >= MAX_DEPTH => Step::Cut(None),
            Some(b'{') => {
                self.pos += 1;
                self.depth += 1;
                let step = self.object();
                self.depth -= 1;
                step
            }
            Some(b'[') => {
                self.pos += 1;
                self.depth += 1;
                let step = self.array();
                self.depth -= 1;
                step
            }
            Some(b'"') => {
                self.pos += 1;
                match self.string() {
                    Ok(s) => Step::Done(Value::String(s)),
                    Err(partial) => match self.mode {
                        Truncation::Keep => Step::Cut(Some(Value::String(partial))),
                        Truncation::Drop => Step::Cut(None),
                    },
                }
            }
            Some(b't') => self.literal("true", Value::Bool(true)),
            Some(b'f') => self.literal("false", Value::Bool(false)),
            Some(b'n') => self.literal("null", Value::Null),
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(_) => Step::Cut(None),
        }
    }

    fn object(&mut self) -> Step {
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Step::Cut(Some(Value::Object(map))),
                Some(b'}') => {
                    self.pos += 1;
                    return Step::Done(Value::Object(map));
                }
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                Some(b'"') => {
                    self.pos += 1;
                }
                Some(_) => return Step::Cut(Some(Value::Object(map))),
            }

            let Ok(key) = self.string() else {
                return Step::Cut(Some(Value::Object(map)));
            };
            self.skip_ws();
            if self.peek() != Some(b':') {
                return Step::Cut(Some(Value::Object(map)));
            }
            self.pos += 1;

            match self.value() {
                Step::Done(value) => {
                    map.insert(key, value);
                }
                Step::Cut(value) => {
                    if let Some(value) = value {
                        map.insert(key, value);
                    }
                    return Step::Cut(Some(Value::Object(map)));
                }
            }
        }
    }

    fn array(&mut self) -> Step {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Step::Cut(Some(Value::Array(items))),
                Some(b']') => {
                    self.pos += 1;
                    return Step::Done(Value::Array(items));
                }
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                Some(_) => {}
            }

            match self.value() {
                Step::Done(value) => items.push(value),
                Step::Cut(value) => {
                    if let Some(value) = value {
                        items.push(value);
                    }
                    return Step::Cut(Some(Value::Array(items)));
                }
            }
        }
    }

    /// Reads a string body after the opening quote. `Err` carries the decoded
    /// prefix when input ends before the closing quote.
    fn string(&mut self) -> Result<String, String> {
        let mut out = String::new();
        loop {
            let start = self.pos;
            while let Some(b) = self.peek() {
                if b == b'"' || b == b'\\' {
                    break;
                }
                self.pos += 1;
            }
            out.push_str(&self.src[start..self.pos]);

            match self.peek() {
                None => return Err(out),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(_) => {
                    self.pos += 1;
                    let Some(escape) = self.peek() else {
                        return Err(out);
                    };
                    self.pos += 1;
                    match escape {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{8}'),
                        b'f' => out.push('\u{c}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => match self.unicode_escape() {
                            Some(ch) => out.push(ch),
                            None => return Err(out),
                        },
                        _ => return Err(out),
                    }
                }
            }
        }
    }

    fn unicode_escape(&mut self) -> Option<char> {
        let high = self.hex4()?;
        if !(0xD800..0xDC00).contains(&high) {
            return char::from_u32(high);
        }
        if self.bytes.get(self.pos..self.pos + 2) != Some(b"\\u") {
            return None;
        }
        self.pos += 2;
        let low = self.hex4()?;
        let combined = 0x10000 + ((high - 0xD800) << 10) + (low.checked_sub(0xDC00)?);
        char::from_u32(combined)
    }

    fn hex4(&mut self) -> Option<u32> {
        let digits = self.src.get(self.pos..self.pos + 4)?;
        let code = u32::from_str_radix(digits, 16).ok()?;
        self.pos += 4;
        Some(code)
    }

    fn number(&mut self) -> Step {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        let token = &self.src[start..self.pos];

        if self.peek().is_none() {
            // A number touching end of input may still grow.
            return match self.mode {
                Truncation::Drop => Step::Cut(None),
                Truncation::Keep => {
                    let trimmed = token.trim_end_matches(['.', 'e', 'E', '+', '-']);
                    Step::Cut(serde_json::from_str::<Value>(trimmed).ok())
                }
            };
        }

        match serde_json::from_str::<Value>(token) {
            Ok(value) => Step::Done(value),
            Err(_) => Step::Cut(None),
        }
    }

    fn literal(&mut self, word: &str, value: Value) -> Step {
        let rest = &self.src[self.pos..];
        if rest.starts_with(word) {
            self.pos += word.len();
            return Step::Done(value);
        }
        if word.starts_with(rest) {
            self.pos = self.bytes.len();
            return match self.mode {
                Truncation::Keep => Step::Cut(Some(value)),
                Truncation::Drop => Step::Cut(None),
            };
        }
        Step::Cut(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = r#"{"description": "Make the hero bigger \"now\" ä", "resetConfirmed": false, "build": [{"op": "add", "type": "Heading", "id": "h-1", "props": {"title": "Team", "level": 2}, "index": 0, "zone": "root:default-zone"}, {"op": "update", "id": "h-1", "props": {"size": "lg", "items": [1, 2.5, -3e2, null, true]}}, {"op": "delete", "id": "old"}]}"#;

    /// `a` is contained in `b`: same scalars, every key/element of `a` present in `b`.
    fn settles_into(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Object(a), Value::Object(b)) => a
                .iter()
                .all(|(k, v)| b.get(k).is_some_and(|bv| settles_into(v, bv))),
            (Value::Array(a), Value::Array(b)) => {
                a.len() <= b.len() && a.iter().zip(b).all(|(x, y)| settles_into(x, y))
            }
            _ => a == b,
        }
    }

    fn prefixes(text: &str) -> impl Iterator<Item = &str> {
        text.char_indices()
            .map(|(idx, _)| &text[..idx])
            .chain(std::iter::once(text))
    }

    #[test]
    fn complete_document_matches_strict_parser() {
        let strict: Value = serde_json::from_str(DOC).unwrap();
        assert_eq!(parse_partial(DOC), Some(strict.clone()));
        assert_eq!(parse_settled(DOC), Some(strict));
    }

    #[test]
    fn settled_values_never_regress_across_prefixes() {
        let mut previous: Option<Value> = None;
        for prefix in prefixes(DOC) {
            let current = parse_settled(prefix);
            if let (Some(prev), Some(cur)) = (&previous, &current) {
                assert!(
                    settles_into(prev, cur),
                    "regressed at prefix {prefix:?}: {prev} -> {cur}"
                );
            }
            if current.is_some() {
                previous = current;
            } else {
                assert!(previous.is_none(), "lost value at prefix {prefix:?}");
            }
        }
    }

    #[test]
    fn build_array_length_never_shrinks_in_keep_mode() {
        let mut last_len = 0;
        for prefix in prefixes(DOC) {
            let len = parse_partial(prefix)
                .and_then(|v| v.get("build").and_then(Value::as_array).map(Vec::len))
                .unwrap_or(0);
            assert!(len >= last_len, "build shrank at prefix {prefix:?}");
            last_len = len;
        }
        assert_eq!(last_len, 3);
    }

    #[test]
    fn keep_mode_returns_truncated_string() {
        assert_eq!(
            parse_partial(r#"{"description": "Make the he"#),
            Some(json!({"description": "Make the he"}))
        );
    }

    #[test]
    fn drop_mode_omits_truncated_scalars() {
        assert_eq!(
            parse_settled(r#"{"build": [{"op": "add", "id": "he"#),
            Some(json!({"build": [{"op": "add"}]}))
        );
        assert_eq!(parse_settled(r#"{"index": 1"#), Some(json!({})));
        assert_eq!(parse_settled(r#"{"index": 12,"#), Some(json!({"index": 12})));
        assert_eq!(parse_settled(r#"{"ok": tr"#), Some(json!({})));
    }

    #[test]
    fn partial_key_is_dropped() {
        assert_eq!(parse_partial(r#"{"a": 1, "desc"#), Some(json!({"a": 1})));
        assert_eq!(parse_partial(r#"{"a": 1, "desc": "#), Some(json!({"a": 1})));
    }

    #[test]
    fn truncated_escape_is_not_emitted() {
        assert_eq!(parse_partial(r#"["ab\"#), Some(json!(["ab"])));
        assert_eq!(parse_partial(r#"["ab\u00"#), Some(json!(["ab"])));
    }

    #[test]
    fn deep_nesting_is_cut_at_depth_limit() {
        let text = format!(r#"{{"description":"x","build":{}"#, "[".repeat(20_000));
        let value = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || parse_partial(&text))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(value["description"], "x");

        let mut depth = 0;
        let mut cursor = &value["build"];
        while let Some(inner) = cursor.as_array().and_then(|items| items.first()) {
            cursor = inner;
            depth += 1;
        }
        assert!(depth < MAX_DEPTH);
    }

    #[test]
    fn garbage_yields_what_was_parsed_before_it() {
        assert_eq!(parse_partial(r#"{"a": [1, 2} oops"#), Some(json!({"a": [1, 2]})));
        assert_eq!(parse_partial("not json"), None);
        assert_eq!(parse_partial(""), None);
    }
}
