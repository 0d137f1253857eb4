//! Version Comparison
//!
//! Total ordering over free-form version strings ("1.2", "1.0b1", "2.0 rc 3").

use std::cmp::Ordering;

/// Capability for ordering version strings.
///
/// The selector never hard-codes an ordering; tests inject synthetic ones.
/// Any `Fn(&str, &str) -> Ordering` closure implements this trait.
pub trait VersionComparator: Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

impl<F> VersionComparator for F
where
    F: Fn(&str, &str) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &str, b: &str) -> Ordering {
        self(a, b)
    }
}

/// Default comparator for dotted / mixed alphanumeric versions.
///
/// A version is split into runs of digits, runs of other text, and single
/// separator characters (`.` and whitespace). Runs are compared pairwise:
/// numbers by value, text lexicographically, separators as equal. When the
/// kinds differ the rank is `Text < End < Separator < Number`, so
///
/// - `"1.2" < "1.2.1"` (the longer version continues with a separator)
/// - `"1.0b1" < "1.0"` (the longer version continues with text)
/// - `"1.0" < "1.1"`, `"2.0" > "1.9.9"`
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardVersionComparator;

impl StandardVersionComparator {
    pub fn new() -> Self {
        Self
    }
}

impl VersionComparator for StandardVersionComparator {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        compare_versions(a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run<'a> {
    Text(&'a str),
    Separator,
    Number(&'a str),
}

impl Run<'_> {
    // End of input sits between Text and Separator.
    fn rank(&self) -> u8 {
        match self {
            Run::Text(_) => 0,
            Run::Separator => 2,
            Run::Number(_) => 3,
        }
    }
}

const END_RANK: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharKind {
    Digit,
    Separator,
    Text,
}

fn kind_of(c: char) -> CharKind {
    if c.is_ascii_digit() {
        CharKind::Digit
    } else if c == '.' || c.is_whitespace() {
        CharKind::Separator
    } else {
        CharKind::Text
    }
}

fn split_runs(version: &str) -> Vec<Run<'_>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut current: Option<CharKind> = None;

    for (idx, c) in version.char_indices() {
        let kind = kind_of(c);
        match current {
            Some(prev) if prev == kind && kind != CharKind::Separator => {}
            Some(prev) => {
                runs.push(make_run(prev, &version[start..idx]));
                start = idx;
                current = Some(kind);
            }
            None => {
                start = idx;
                current = Some(kind);
            }
        }
    }
    if let Some(kind) = current {
        runs.push(make_run(kind, &version[start..]));
    }
    runs
}

fn make_run(kind: CharKind, text: &str) -> Run<'_> {
    match kind {
        CharKind::Digit => Run::Number(text),
        CharKind::Separator => Run::Separator,
        CharKind::Text => Run::Text(text),
    }
}

/// Compare two digit strings by numeric value without parsing into a fixed
/// width integer.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_runs(a: &Run<'_>, b: &Run<'_>) -> Ordering {
    match (a, b) {
        (Run::Number(x), Run::Number(y)) => compare_digits(x, y),
        (Run::Text(x), Run::Text(y)) => x.cmp(y),
        (Run::Separator, Run::Separator) => Ordering::Equal,
        _ => a.rank().cmp(&b.rank()),
    }
}

/// Compare two versions with the standard rules.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let runs_a = split_runs(a.trim());
    let runs_b = split_runs(b.trim());

    for (x, y) in runs_a.iter().zip(runs_b.iter()) {
        let ord = compare_runs(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match runs_a.len().cmp(&runs_b.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Greater => runs_a[runs_b.len()].rank().cmp(&END_RANK),
        Ordering::Less => END_RANK.cmp(&runs_b[runs_a.len()].rank()),
    }
}

/// Check if version `a` is strictly newer than `b` under `comparator`.
pub fn is_newer(comparator: &dyn VersionComparator, a: &str, b: &str) -> bool {
    comparator.compare(a, b) == Ordering::Greater
}

/// Sort versions ascending. Stable, so equal versions keep input order.
pub fn sort_versions(comparator: &dyn VersionComparator, versions: &mut [String]) {
    versions.sort_by(|a, b| comparator.compare(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &str, b: &str) -> Ordering {
        StandardVersionComparator.compare(a, b)
    }

    #[test]
    fn test_documented_examples() {
        assert_eq!(cmp("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(cmp("1.0b1", "1.0"), Ordering::Less);
        assert_eq!(cmp("2.0", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_numeric_runs_compare_by_value() {
        assert_eq!(cmp("1.10", "1.9"), Ordering::Greater);
        assert_eq!(cmp("1.01", "1.1"), Ordering::Equal);
        assert_eq!(cmp("100", "99"), Ordering::Greater);
        // Wider than u64
        assert_eq!(
            cmp("1.184467440737095516160", "1.18446744073709551615"),
            Ordering::Greater
        );
    }

    #[test]
    fn test_prerelease_ordering() {
        assert_eq!(cmp("1.0a1", "1.0b1"), Ordering::Less);
        assert_eq!(cmp("1.0b1", "1.0b2"), Ordering::Less);
        assert_eq!(cmp("1.0b2", "1.0rc1"), Ordering::Less);
        assert_eq!(cmp("1.0rc1", "1.0"), Ordering::Less);
        assert_eq!(cmp("1.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_reflexive_equality() {
        for v in ["", "1", "1.0", "1.0b1", "2.0 (1234)", "abc"] {
            assert_eq!(cmp(v, v), Ordering::Equal, "{v}");
        }
    }

    #[test]
    fn test_antisymmetry() {
        let versions = ["1", "1.0", "1.0.0", "1.0b", "1.0b1", "1a", "a", "1 2", "0.9"];
        for a in versions {
            for b in versions {
                assert_eq!(cmp(a, b), cmp(b, a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_transitivity() {
        let versions = [
            "", "0", "0.9", "1", "1.0", "1.0.0", "1.0.1", "1.0a", "1.0a1", "1.0b1", "1.0b2",
            "1.0rc1", "1.1", "1.2", "1.2.1", "1.9.9", "1.10", "2.0", "2.0 beta", "2.0.0.1",
            "a", "a1", "beta", "1..2", "1.2b", "01.2",
        ];
        for a in versions {
            for b in versions {
                for c in versions {
                    if cmp(a, b) == Ordering::Less && cmp(b, c) == Ordering::Less {
                        assert_eq!(cmp(a, c), Ordering::Less, "{a} < {b} < {c}");
                    }
                    if cmp(a, b) == Ordering::Equal && cmp(b, c) == Ordering::Equal {
                        assert_eq!(cmp(a, c), Ordering::Equal, "{a} = {b} = {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_closure_comparator() {
        let reverse = |a: &str, b: &str| compare_versions(b, a);
        assert_eq!(reverse.compare("1.0", "2.0"), Ordering::Greater);
        assert!(is_newer(&reverse, "1.0", "2.0"));
    }

    #[test]
    fn test_sort_versions() {
        let mut versions: Vec<String> = ["1.10", "1.2", "1.0b1", "1.0", "1.2.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        sort_versions(&StandardVersionComparator, &mut versions);
        assert_eq!(versions, vec!["1.0b1", "1.0", "1.2", "1.2.1", "1.10"]);
    }
}
