//! File selection patterns.
//!
//! A pattern is a literal path, a wildcard expression (`*`, `?`), or a
//! directory-rooted prefix ending in a path separator. Matching is
//! case-insensitive; path separator characters are literal.

use regex::{Regex, RegexBuilder};

use crate::error::{Result, TapeError};

/// Compile one pattern into an anchored, case-insensitive regex.
///
/// All regex metacharacters are escaped, then `*` becomes `.*` and `?`
/// becomes `.`. A trailing separator expands to `*.*` first, so a bare
/// directory prefix selects everything under it.
pub fn pattern_to_regex(pattern: &str) -> Result<Regex> {
    let mut pat = pattern.to_string();
    if pat.ends_with('/') || pat.ends_with('\\') {
        pat.push_str("*.*");
    }

    let mut expr = String::with_capacity(pat.len() * 2 + 2);
    expr.push('^');
    for c in pat.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '\\' | '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '#' => {
                expr.push('\\');
                expr.push(c);
            }
            c => expr.push(c),
        }
    }
    expr.push('$');

    RegexBuilder::new(&expr)
        .case_insensitive(true)
        .build()
        .map_err(|e| TapeError::InvalidData(format!("bad pattern {:?}: {}", pattern, e)))
}

/// A compiled pattern list.
///
/// `None` means "all files"; an empty list means "none"; otherwise the
/// union of the individual matches.
pub struct PatternSet {
    regexes: Option<Vec<Regex>>,
}

impl PatternSet {
    pub fn compile(patterns: Option<&[String]>) -> Result<PatternSet> {
        let regexes = match patterns {
            None => None,
            Some(list) => Some(
                list.iter()
                    .map(|p| pattern_to_regex(p))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(PatternSet { regexes })
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.regexes {
            None => true,
            Some(regexes) => regexes.iter().any(|r| r.is_match(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        pattern_to_regex(pattern).unwrap().is_match(path)
    }

    #[test]
    fn literal_patterns() {
        assert!(matches("/data/report.txt", "/data/report.txt"));
        assert!(matches("/data/report.txt", "/DATA/Report.TXT"));
        assert!(!matches("/data/report.txt", "/data/report.txt.bak"));
    }

    #[test]
    fn star_and_question() {
        assert!(matches("/data/*.txt", "/data/a.txt"));
        assert!(matches("/data/*.txt", "/data/sub/deep.txt"));
        assert!(matches("/data/rep?rt.txt", "/data/report.txt"));
        assert!(!matches("/data/rep?rt.txt", "/data/repoort.txt"));
        assert!(!matches("*.txt", "notes.text"));
    }

    #[test]
    fn trailing_separator_selects_directory_contents() {
        assert!(matches("/data/", "/data/report.txt"));
        assert!(matches("C:\\backup\\", "C:\\backup\\img.raw"));
        assert!(!matches("/data/", "/database"));
    }

    #[test]
    fn metacharacters_stay_literal() {
        assert!(matches("/a+b/(1).txt", "/a+b/(1).txt"));
        assert!(!matches("/a+b/(1).txt", "/aab/(1).txt"));
        assert!(matches("/logs/day[1].log", "/logs/day[1].log"));
    }

    #[test]
    fn pattern_set_semantics() {
        let all = PatternSet::compile(None).unwrap();
        assert!(all.matches("/anything"));

        let none = PatternSet::compile(Some(&[])).unwrap();
        assert!(!none.matches("/anything"));

        let union = PatternSet::compile(Some(&[
            "/a/*.txt".to_string(),
            "/b/*.log".to_string(),
        ]))
        .unwrap();
        assert!(union.matches("/a/x.txt"));
        assert!(union.matches("/b/y.log"));
        assert!(!union.matches("/c/z.dat"));
    }
}
