use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Searches each root up to `max_depth` levels deep for entries whose name
/// matches one of `patterns` (case-insensitive, `*` and `?` wildcards).
/// Matches are canonicalized, so overlapping roots report a path once.
/// Unreadable directories are skipped.
pub fn discover(roots: &[PathBuf], max_depth: usize, patterns: &[String]) -> Vec<PathBuf> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|pattern| pattern.trim().to_lowercase())
        .filter(|pattern| !pattern.is_empty())
        .collect();
    let mut found = BTreeSet::new();
    for root in roots {
        visit(root, 1, max_depth, &patterns, &mut found);
    }
    found.into_iter().collect()
}

fn visit(dir: &Path, depth: usize, max_depth: usize, patterns: &[String], found: &mut BTreeSet<PathBuf>) {
    if depth > max_depth {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let path = entry.path();
        if patterns.iter().any(|pattern| wildcard_match(pattern, &name)) {
            found.insert(fs::canonicalize(&path).unwrap_or(path));
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            visit(&path, depth + 1, max_depth, patterns, found);
        }
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Under the system-wide application root; removal needs elevation.
    pub admin: Vec<PathBuf>,
    pub user: Vec<PathBuf>,
}

pub fn partition(paths: &[PathBuf], admin_root: &Path) -> Partition {
    let mut out = Partition::default();
    for path in paths {
        if path.starts_with(admin_root) {
            out.admin.push(path.clone());
        } else {
            out.user.push(path.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn patterns() -> Vec<String> {
        vec!["zoom*.app".to_string()]
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("zoom*.app", "zoom.us.app"));
        assert!(wildcard_match("zoom*.app", "zoom.app"));
        assert!(wildcard_match("zoom*.app", "zoom workplace.app"));
        assert!(!wildcard_match("zoom*.app", "zoom.us.app.bak"));
        assert!(!wildcard_match("zoom*.app", "myzoom.app"));
        assert!(wildcard_match("us.zoom.?", "us.zoom.x"));
    }

    #[test]
    fn matches_case_insensitively_within_depth() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("Zoom.app/Contents")).unwrap();
        fs::create_dir_all(root.join("a/b/ZOOM.US.APP")).unwrap();
        fs::create_dir_all(root.join("a/b/c/d/e/zoom.app")).unwrap();
        fs::create_dir_all(root.join("Other.app")).unwrap();

        let found = discover(&[root.clone()], 4, &patterns());
        assert_eq!(
            found,
            vec![root.join("Zoom.app"), root.join("a/b/ZOOM.US.APP")]
        );
    }

    #[test]
    fn does_not_descend_into_matches() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("zoom.us.app/Contents/Frameworks/ZoomHelper.app")).unwrap();
        let found = discover(&[root.clone()], 6, &patterns());
        assert_eq!(found, vec![root.join("zoom.us.app")]);
    }

    #[test]
    fn overlapping_roots_report_once() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let apps = root.join("Applications");
        fs::create_dir_all(apps.join("zoom.us.app")).unwrap();

        let roots = vec![root.clone(), apps.clone(), apps.join(".").join("..").join("Applications")];
        let found = discover(&roots, 4, &patterns());
        assert_eq!(found, vec![apps.join("zoom.us.app")]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_resolves_to_real_path() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let real = root.join("real");
        fs::create_dir_all(real.join("Zoom.app")).unwrap();
        std::os::unix::fs::symlink(&real, root.join("alias")).unwrap();

        let found = discover(&[real.clone(), root.join("alias")], 2, &patterns());
        assert_eq!(found, vec![real.join("Zoom.app")]);
    }

    #[test]
    fn missing_roots_are_not_errors() {
        let found = discover(&[PathBuf::from("/nonexistent/zoomfix-root")], 4, &patterns());
        assert!(found.is_empty());
    }

    #[test]
    fn partition_splits_on_admin_root() {
        let paths = vec![
            PathBuf::from("/Applications/zoom.us.app"),
            PathBuf::from("/Users/me/Applications/Zoom.app"),
            PathBuf::from("/ApplicationsBackup/Zoom.app"),
            PathBuf::from("/Applications/Utilities/Zoom.app"),
        ];
        let split = partition(&paths, Path::new("/Applications"));
        assert_eq!(
            split.admin,
            vec![
                PathBuf::from("/Applications/zoom.us.app"),
                PathBuf::from("/Applications/Utilities/Zoom.app"),
            ]
        );
        assert_eq!(
            split.user,
            vec![
                PathBuf::from("/Users/me/Applications/Zoom.app"),
                PathBuf::from("/ApplicationsBackup/Zoom.app"),
            ]
        );
        let mut union: Vec<PathBuf> = split.admin.iter().chain(split.user.iter()).cloned().collect();
        union.sort();
        let mut expected = paths.clone();
        expected.sort();
        assert_eq!(union, expected);
        assert!(split.admin.iter().all(|p| !split.user.contains(p)));
    }
}
