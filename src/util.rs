// SPDX-License-Identifier: AGPL-3.0-only

use rand::Rng;

/// Very small, safe-ish shell escaper for remote command arguments.
pub(crate) fn sh_escape(p: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&p.replace('\'', r"'\''"));
    out.push('\'');
    out
}

/// Ancestor directories of a POSIX-style remote file path, shallowest first.
///
/// `/a/b/c/out.bin` yields `["/a", "/a/b", "/a/b/c"]`. Relative paths stay
/// relative (SFTP resolves them against the login directory), so
/// `work/j1/in.bin` yields `["work", "work/j1"]`. The file component itself
/// is not included; the root is never returned.
pub(crate) fn remote_parent_dirs(remote_file: &str) -> Vec<String> {
    let absolute = remote_file.starts_with('/');
    let trimmed = remote_file.trim_end_matches('/');
    let Some((parent, _file)) = trimmed.rsplit_once('/') else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    let mut cur = String::new();
    for seg in parent.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if absolute || !cur.is_empty() {
            cur.push('/');
        }
        cur.push_str(seg);
        paths.push(cur.clone());
    }
    paths
}

/// Join a remote directory and a file name with forward slashes.
pub(crate) fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Random lowercase suffix used to namespace per-job staging directories.
pub(crate) fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..26);
            (b'a' + idx) as char
        })
        .collect()
}
