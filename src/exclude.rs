//! Exclusion patterns, checked on both save and restore.
//!
//! A pattern matches shell-style (`*`, `?`, `[set]`). An object is
//! excluded when any pattern matches its basename, its full relative
//! path, or any ancestor directory of that path.

/// Shell-style wildcard match over bytes.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                // star swallows zero or more bytes
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(b'['), Some(&c)) => match parse_class(&p[1..]) {
                Some((matches, rest)) if matches(c) => inner(rest, &t[1..]),
                Some(_) => false,
                None => c == b'[' && inner(&p[1..], &t[1..]),
            },
            (Some(&pc), Some(&tc)) => pc == tc && inner(&p[1..], &t[1..]),
            (Some(_), None) => p.iter().all(|&c| c == b'*'),
        }
    }

    /// Parse a `[...]` class; returns a matcher and the rest of the pattern.
    fn parse_class(p: &[u8]) -> Option<(impl Fn(u8) -> bool, &[u8])> {
        let (negate, body) = match p.first() {
            Some(b'!') | Some(b'^') => (true, &p[1..]),
            _ => (false, p),
        };
        let end = body.iter().position(|&c| c == b']')?;
        let set = &body[..end];
        if set.is_empty() {
            return None;
        }
        let set = set.to_vec();
        let matcher = move |c: u8| {
            let mut hit = false;
            let mut i = 0;
            while i < set.len() {
                if i + 2 < set.len() && set[i + 1] == b'-' {
                    if set[i] <= c && c <= set[i + 2] {
                        hit = true;
                    }
                    i += 3;
                } else {
                    if set[i] == c {
                        hit = true;
                    }
                    i += 1;
                }
            }
            hit != negate
        };
        Some((matcher, &body[end + 1..]))
    }

    inner(pattern.as_bytes(), text.as_bytes())
}

/// True when `relpath` (or any of its ancestors, or its basename) matches
/// one of the exclusion patterns.
pub fn is_excluded(patterns: &[String], relpath: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let relpath = relpath.trim_start_matches('/');

    let mut prefix = String::new();
    for component in relpath.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        for pat in patterns {
            if wildcard_match(pat, component) || wildcard_match(pat, &prefix) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_wildcards() {
        assert!(wildcard_match("*.tmp", "scratch.tmp"));
        assert!(!wildcard_match("*.tmp", "scratch.txt"));
        assert!(wildcard_match("file?", "file1"));
        assert!(!wildcard_match("file?", "file12"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*c*e", "abcde"));
        assert!(wildcard_match("data[0-9]", "data7"));
        assert!(!wildcard_match("data[0-9]", "datax"));
        assert!(wildcard_match("data[!0-9]", "datax"));
    }

    #[test]
    fn exclusion_covers_ancestors_and_basenames() {
        let patterns = vec!["*.cache".to_string(), "tmp".to_string()];
        assert!(is_excluded(&patterns, "home/user/firefox.cache"));
        assert!(is_excluded(&patterns, "tmp/scratch/file"));
        assert!(is_excluded(&patterns, "var/tmp"));
        assert!(!is_excluded(&patterns, "var/temporary/file"));
        assert!(!is_excluded(&patterns, "home/user/file.txt"));
    }

    #[test]
    fn full_path_patterns() {
        let patterns = vec!["home/*/secrets".to_string()];
        assert!(is_excluded(&patterns, "home/alice/secrets"));
        assert!(is_excluded(&patterns, "home/alice/secrets/key.pem"));
        assert!(!is_excluded(&patterns, "etc/secrets"));
    }

    #[test]
    fn empty_patterns_exclude_nothing() {
        assert!(!is_excluded(&[], "any/path"));
    }
}
