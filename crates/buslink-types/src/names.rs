//! Case-convention transform between Rust-side and bus-side member names.
//!
//! Bus members are conventionally CamelCase (`SetMulti`), Rust identifiers are
//! snake_case (`set_multi`). Both directions are pure functions. They
//! round-trip for snake_case identifiers whose segments start with a lowercase
//! ASCII letter.

/// `set_multi` → `SetMulti`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for segment in name.split('_').filter(|s| !s.is_empty()) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// `SetMulti` → `set_multi`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
