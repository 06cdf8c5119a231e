//! Subject wildcard matching.
//!
//! Subjects are dot-separated tokens. In a filter, `*` matches exactly one
//! token and `>` matches one or more trailing tokens. An empty filter selects
//! every subject on the stream.

const SINGLE: &str = "*";
const TAIL: &str = ">";

/// Whether `subject` (a literal) is selected by `filter`.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    if filter.is_empty() {
        return true;
    }

    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(f), Some(s)) if f == SINGLE || f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether two filters can select a common subject.
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }

    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        match (left.next(), right.next()) {
            (Some(TAIL), Some(_)) | (Some(_), Some(TAIL)) => return true,
            (Some(l), Some(r)) if l == SINGLE || r == SINGLE || l == r => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether any filter of `left` overlaps any filter of `right`.
///
/// An empty set means "all subjects" and overlaps everything.
pub fn filter_sets_overlap(left: &[String], right: &[String]) -> bool {
    if left.is_empty() || right.is_empty() {
        return true;
    }
    left.iter()
        .any(|l| right.iter().any(|r| subjects_overlap(l, r)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("jobs.*", "jobs.info"));
        assert!(subject_matches("jobs.>", "jobs.info.extra"));
        assert!(subject_matches("", "anything.at.all"));
        assert!(subject_matches("one", "one"));

        assert!(!subject_matches("jobs.*", "jobs.info.extra"));
        assert!(!subject_matches("jobs.>", "jobs"));
        assert!(!subject_matches("one", "two"));
    }

    #[test]
    fn test_subjects_overlap() {
        assert!(subjects_overlap("two", "two"));
        assert!(subjects_overlap("tasks.*", "tasks.one"));
        assert!(subjects_overlap("tasks.>", "tasks.one.two"));
        assert!(subjects_overlap("tasks.*.x", "tasks.y.*"));
        assert!(subjects_overlap("", "tasks.one"));

        assert!(!subjects_overlap("one", "two"));
        assert!(!subjects_overlap("tasks.example", "tasks.one"));
        assert!(!subjects_overlap("tasks.*", "tasks.one.two"));
        assert!(!subjects_overlap("tasks", "tasks.>"));
    }

    #[test]
    fn test_filter_sets_overlap() {
        let one = vec!["one".to_string()];
        let two = vec!["two".to_string()];
        let both = vec!["one".to_string(), "two".to_string()];

        assert!(!filter_sets_overlap(&one, &two));
        assert!(filter_sets_overlap(&both, &two));
        assert!(filter_sets_overlap(&[], &two));
    }
}
