/// One run of a template string.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum RawPart<'a> {
    Literal(String),
    /// Expression text of a `{...}` field, with any format spec removed.
    Field(&'a str),
    /// Malformed brace usage; kept so the failure surfaces at compile time.
    Invalid { source: &'a str, reason: &'static str },
}

/// Split a template into literal runs and `{expr}` fields.
///
/// `{{` and `}}` are literal braces. A field ends at the first `}` outside a
/// quoted string.
pub(super) fn scan(template: &str) -> Vec<RawPart<'_>> {
    let bytes = template.as_bytes();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut run_start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        match bytes[idx] {
            b'{' if bytes.get(idx + 1) == Some(&b'{') => {
                literal.push_str(&template[run_start..=idx]);
                idx += 2;
                run_start = idx;
            }
            b'}' if bytes.get(idx + 1) == Some(&b'}') => {
                literal.push_str(&template[run_start..=idx]);
                idx += 2;
                run_start = idx;
            }
            b'{' => {
                literal.push_str(&template[run_start..idx]);
                if !literal.is_empty() {
                    parts.push(RawPart::Literal(std::mem::take(&mut literal)));
                }
                match find_field_end(bytes, idx + 1) {
                    Some(end) => {
                        parts.push(RawPart::Field(strip_format_spec(&template[idx + 1..end])));
                        idx = end + 1;
                    }
                    None => {
                        parts.push(RawPart::Invalid {
                            source: &template[idx..],
                            reason: "unclosed '{' in template",
                        });
                        idx = bytes.len();
                    }
                }
                run_start = idx;
            }
            b'}' => {
                literal.push_str(&template[run_start..idx]);
                if !literal.is_empty() {
                    parts.push(RawPart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(RawPart::Invalid {
                    source: "}",
                    reason: "single '}' encountered in template",
                });
                idx += 1;
                run_start = idx;
            }
            _ => idx += 1,
        }
    }

    literal.push_str(&template[run_start..]);
    if !literal.is_empty() {
        parts.push(RawPart::Literal(literal));
    }
    parts
}

fn find_field_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut idx = start;
    while idx < bytes.len() {
        let b = bytes[idx];
        match quote {
            Some(_) if b == b'\\' => idx += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'}' => return Some(idx),
            None => {}
        }
        idx += 1;
    }
    None
}

/// Drop a trailing `:spec` or `!conversion` that sits outside brackets and quotes.
fn strip_format_spec(field: &str) -> &str {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (pos, c) in field.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, ':' | '!') if depth == 0 => return field[..pos].trim(),
            _ => {}
        }
    }
    field.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_literals_and_fields() {
        let parts = scan("[{name},{age + 10}];");
        assert_eq!(
            parts,
            vec![
                RawPart::Literal("[".into()),
                RawPart::Field("name"),
                RawPart::Literal(",".into()),
                RawPart::Field("age + 10"),
                RawPart::Literal("];".into()),
            ]
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let parts = scan("SELECT '{{}}' || {x}");
        assert_eq!(
            parts,
            vec![
                RawPart::Literal("SELECT '{}' || ".into()),
                RawPart::Field("x"),
            ]
        );
    }

    #[test]
    fn format_spec_is_ignored() {
        assert_eq!(scan("{a:>10}"), vec![RawPart::Field("a")]);
        assert_eq!(scan("{d['k:v']!r}"), vec![RawPart::Field("d['k:v']")]);
    }

    #[test]
    fn quoted_brace_inside_field() {
        assert_eq!(scan("{m['}']}"), vec![RawPart::Field("m['}']")]);
    }

    #[test]
    fn malformed_braces_are_reported() {
        assert!(matches!(
            scan("a } b").get(1),
            Some(RawPart::Invalid { source: "}", .. })
        ));
        assert!(matches!(
            scan("select {x").last(),
            Some(RawPart::Invalid { source: "{x", .. })
        ));
    }

    #[test]
    fn cast_suffix_outside_field_is_literal() {
        assert_eq!(
            scan("{sn}::INTEGER"),
            vec![RawPart::Field("sn"), RawPart::Literal("::INTEGER".into())]
        );
    }
}
