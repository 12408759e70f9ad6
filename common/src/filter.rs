// Filename filter
// Glob-style matching with `*`, `?`, optional `.` and `|` alternation, case-insensitive

use regex::RegexBuilder;

use crate::models::FileRecord;

/// Check whether a filename matches a filter pattern
///
/// Both sides are trimmed. Each `|`-separated alternative is trimmed and
/// anchored independently; the filename matches when any alternative does.
/// In a pattern `*` matches any run of characters, `?` exactly one, and `.`
/// an optional literal dot. Everything else is literal.
///
/// # Examples
/// ```
/// use common::filter::matches;
/// assert!(matches("TEST.TXT", "*.txt|*.xtx"));
/// assert!(!matches("d.txt", "a.txt|b.txt|c.txt"));
/// ```
pub fn matches(filename: &str, pattern: &str) -> bool {
    let filename = filename.trim();
    pattern
        .trim()
        .split('|')
        .any(|alternative| matches_single(filename, alternative.trim()))
}

/// Keep the records whose name matches `pattern`, preserving order
pub fn filter_records(records: &[FileRecord], pattern: &str) -> Vec<FileRecord> {
    records
        .iter()
        .filter(|record| matches(&record.name, pattern))
        .cloned()
        .collect()
}

fn matches_single(filename: &str, pattern: &str) -> bool {
    let expression = glob_to_regex(pattern);
    // Every literal is escaped, so compilation can only fail on size limits
    RegexBuilder::new(&expression)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(filename))
        .unwrap_or(false)
}

fn glob_to_regex(pattern: &str) -> String {
    let mut expression = String::with_capacity(pattern.len() * 2 + 2);
    expression.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            '.' => expression.push_str(r"\.?"),
            other => {
                let mut buf = [0u8; 4];
                expression.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    expression.push('$');
    expression
}
