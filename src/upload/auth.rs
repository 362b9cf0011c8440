//! Upload-server HTTP basic auth (spec §4.9). Each configured user owns a
//! directory prefix and a wildcard pattern that the derived slug must
//! match.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct AuthEntry {
    pub user: String,
    pub pass: String,
    /// Glob-style pattern (`*` only) the derived slug must match.
    pub matches: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub allowed_dirs: Vec<String>,
    pub users: Vec<AuthEntry>,
}

pub struct StaticAuth {
    allowed_dirs: Vec<String>,
    users: HashMap<String, AuthEntry>,
}

impl StaticAuth {
    pub fn new(config: AuthConfig) -> Self {
        let allowed_dirs = config
            .allowed_dirs
            .into_iter()
            .map(|mut dir| {
                if !dir.ends_with('/') {
                    dir.push('/');
                }
                dir
            })
            .collect();
        let users = config.users.into_iter().map(|e| (e.user.clone(), e)).collect();
        Self { allowed_dirs, users }
    }

    /// Checks credentials and derives the slug that `path` authorizes
    /// writes under, along with the path relative to the stripped allowed
    /// directory (what the output root join should use, per spec "paths
    /// relative to configured output root"). Returns `None` on any failure -
    /// bad user, bad password, path outside every allowed directory, or a
    /// slug that doesn't match the user's pattern.
    pub fn authorize(&self, user: &str, pass: &str, path: &str) -> Option<(String, String)> {
        let entry = self.users.get(user)?;
        if !constant_time_eq(pass.as_bytes(), entry.pass.as_bytes()) {
            return None;
        }

        let cleaned = clean_path(path);
        let remainder = self
            .allowed_dirs
            .iter()
            .find_map(|prefix| cleaned.strip_prefix(prefix.as_str()))?;

        let slug = remainder.split('/').next().unwrap_or("");
        if slug.is_empty() {
            return None;
        }
        if !wildcard_match(&entry.matches, slug) {
            return None;
        }
        Some((slug.to_string(), remainder.to_string()))
    }
}

fn clean_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Matches `pattern` against `text`, where `*` stands for any run of
/// characters (including none) and every other character is literal.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut match_from) = (None, 0usize);

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            match_from = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            match_from += 1;
            ti = match_from;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}
