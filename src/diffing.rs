use similar::TextDiff;

/// Unified diff between two response bodies, used for content-change
/// records.
pub fn unified(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("previous", "current")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_marks_changed_lines() {
        let diff = unified("v1", "v2");
        assert!(diff.contains("-v1"));
        assert!(diff.contains("+v2"));
    }

    #[test]
    fn diff_keeps_context() {
        let old = "a\nb\nc\nd\n";
        let new = "a\nb\nx\nd\n";
        let diff = unified(old, new);
        assert!(diff.contains("-c"));
        assert!(diff.contains("+x"));
        assert!(diff.contains(" a"));
    }
}
