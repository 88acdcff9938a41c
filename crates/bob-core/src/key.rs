//! Worker key normalization.

use std::sync::LazyLock;

use regex::Regex;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w]+").expect("static pattern is valid"));

/// Derive the registry key for a worker display name.
///
/// Lower-cases the name and collapses every run of non-word characters into a
/// single `-`. `"Hearing Brain"` becomes `"hearing-brain"`.
pub fn key(name: &str) -> String {
    NON_WORD.replace_all(&name.to_lowercase(), "-").into_owned()
}

/// Whether a key contains at least one word character.
///
/// Names such as `""` or `"!!"` produce keys made only of separators, which
/// the broker refuses to register.
pub fn is_usable(key: &str) -> bool {
    key.chars().any(|c| c != '-')
}
