//! Glob matching for class and method name patterns.
//!
//! The command grammar only ever needs `*` as a multi-character wildcard,
//! matched per path component for class names (`com.example.*` matches
//! any class directly... and transitively, see below) and as a plain
//! substring wildcard for method names. The grammar is small enough that
//! reaching for a regex engine would be the wrong tool, so it is
//! hand-rolled here.

/// Matches `text` against `pattern`, where `*` in `pattern` matches any
/// run of zero or more characters (including none, and including `.`).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Try consuming zero, then one, then two, ... characters of text
            // for this `*` before matching the remaining pattern.
            for split in 0..=text.len() {
                if match_from(&pattern[1..], &text[split..]) {
                    return true;
                }
            }
            false
        }
        Some(c) => match text.first() {
            Some(t) if t == c => match_from(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

/// A compiled class-name pattern.
///
/// A pattern with no `*` at all is treated as a literal fully-qualified
/// class name. A pattern containing `*` is matched with [`glob_match`]
/// against the whole class name (e.g. `com.example.*` matches
/// `com.example.Foo` and `com.example.sub.Bar` alike -- `*` is a
/// multi-character wildcard, not a single-segment one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPattern(String);

impl ClassPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        ClassPattern(pattern.into())
    }

    pub fn matches(&self, class_name: &str) -> bool {
        glob_match(&self.0, class_name)
    }

    /// A cheap pre-filter usable before a full class reflection is
    /// available: true iff this pattern *could* match some class whose
    /// name is, or starts with the literal prefix of, `class_name_prefix`.
    /// Conservative: only ever returns `false` when a match is truly
    /// impossible.
    pub fn might_match_prefix(&self, class_name_prefix: &str) -> bool {
        match self.0.find('*') {
            None => self.0.starts_with(class_name_prefix) || class_name_prefix.starts_with(&self.0),
            Some(star_idx) => {
                let literal_prefix = &self.0[..star_idx];
                class_name_prefix.starts_with(literal_prefix) || literal_prefix.starts_with(class_name_prefix)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPattern(String);

impl MethodPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        MethodPattern(pattern.into())
    }

    pub fn matches(&self, method_name: &str) -> bool {
        glob_match(&self.0, method_name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
