//! Dialect detection: classifying a raw source string as the concise DSL
//! or the legacy method-chain syntax before parsing it.
//!
//! An ordered list of priority checks with a fixed fallback, rather than
//! a formal grammar-ambiguity resolution: each check is cheap and
//! specific enough that order alone resolves any overlap between the two
//! grammars' surface forms.

/// Which surface syntax a source string should be parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// The concise DSL.
    Dsl,
    /// The legacy method-chain syntax.
    Legacy,
}

/// Classify a source string as DSL or legacy using a fixed set of
/// surface-syntax heuristics. Ambiguous strings default to legacy, for
/// backward compatibility.
#[must_use]
pub fn detect(source: &str) -> Dialect {
    let trimmed = source.trim();

    if is_plain_number(trimmed) {
        return Dialect::Dsl;
    }

    if looks_like_legacy(trimmed) {
        return Dialect::Legacy;
    }

    if looks_like_dsl(trimmed) {
        return Dialect::Dsl;
    }

    Dialect::Legacy
}

fn is_plain_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

fn looks_like_dsl(s: &str) -> bool {
    starts_with_note_ref(s)
        || s.starts_with("base.")
        || contains_fraction_literal(s)
        || s.contains("tempo(")
        || s.contains("measure(")
        || s.contains("beat(")
}

fn starts_with_note_ref(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('[') else {
        return false;
    };
    let Some(close) = rest.find(']') else {
        return false;
    };
    rest[..close].chars().all(|c| c.is_ascii_digit()) && rest[close + 1..].starts_with('.')
}

/// `( intLiteral / intLiteral )` appearing anywhere in the string.
fn contains_fraction_literal(s: &str) -> bool {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'(' {
            continue;
        }
        let rest = &s[i + 1..];
        let rest = rest.trim_start();
        let Some(after_num) = rest.find(|c: char| !c.is_ascii_digit()) else {
            continue;
        };
        if after_num == 0 {
            continue;
        }
        let rest = rest[after_num..].trim_start();
        let Some(rest) = rest.strip_prefix('/') else {
            continue;
        };
        let rest = rest.trim_start();
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits_end == 0 {
            continue;
        }
        if rest[digits_end..].trim_start().starts_with(')') {
            return true;
        }
    }
    false
}

fn looks_like_legacy(s: &str) -> bool {
    s.contains("new Fraction(")
        || s.contains("module.getNoteById")
        || s.contains("module.baseNote")
        || s.contains(".getVariable(")
        || s.contains(".mul(")
        || s.contains(".div(")
        || s.contains(".add(")
        || s.contains(".sub(")
        || s.contains(".pow(")
        || s.contains(".neg(")
        || s.contains("module.findTempo")
        || s.contains("module.findMeasureLength")
}
