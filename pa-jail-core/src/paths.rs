//! Pathname sanitization and string-level path helpers.
//!
//! Jail paths are handled as plain strings after sanitization: the
//! sanitizer admits only a small ASCII repertoire, which makes prefix
//! comparisons against `permdir`, slash counting for policy patterns, and
//! the populator's suffix surgery well-defined on bytes.

use crate::errors::JailError;

const ALLOWED: &[u8] = b"/0123456789-._ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz~";

const MAX_PATH: usize = 1024;

/// Canonicalize a user-supplied pathname, or reject it.
///
/// Accepts only `[A-Za-z0-9/._~-]`, refuses empty names, names starting
/// with `~`, names of 1024 bytes or more, and any `..` component.
/// Collapses `/./` to `/` and runs of `/` to a single `/`, and strips
/// trailing slashes (a lone `/` survives). Idempotent on its own output.
pub fn sanitize(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes[0] == b'~' || bytes.len() >= MAX_PATH {
        return None;
    }
    if bytes.iter().any(|b| !ALLOWED.contains(b)) {
        return None;
    }

    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let at_component_start = i == 0 || bytes[i - 1] == b'/';
        if c == b'.'
            && at_component_start
            && bytes.get(i + 1) == Some(&b'.')
            && matches!(bytes.get(i + 2), None | Some(b'/'))
        {
            return None;
        }
        if c == b'.' && i > 0 && bytes[i - 1] == b'/' && matches!(bytes.get(i + 1), None | Some(b'/')) {
            // "/./" collapses to "/"; the preceding slash is already out.
            i += if bytes.get(i + 1).is_some() { 2 } else { 1 };
            continue;
        }
        out.push(c);
        if c == b'/' {
            while bytes.get(i + 1) == Some(&b'/') {
                i += 1;
            }
        }
        i += 1;
    }
    while out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }
    // Only ASCII was admitted above.
    Some(String::from_utf8(out).expect("sanitized path is ASCII"))
}

/// Make `name` absolute by prefixing the current working directory.
pub fn absolute(name: &str) -> Result<String, JailError> {
    if name.starts_with('/') {
        return Ok(name.to_string());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| JailError::sys("pwd", nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0))))?;
    let mut cwd = cwd.to_string_lossy().into_owned();
    while cwd.len() > 1 && cwd.ends_with('/') {
        cwd.pop();
    }
    Ok(format!("{}/{}", cwd, name))
}

/// Return `path` with exactly one trailing slash.
pub fn end_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Return `path` without trailing slashes (a lone `/` survives).
pub fn no_end_slash(path: &str) -> String {
    let mut path = path.to_string();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// Return the prefix of `path` up to and including the slash before its
/// final component.
pub fn parent_dir(path: &str) -> &str {
    let bytes = path.as_bytes();
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    while end > 0 && bytes[end - 1] != b'/' {
        end -= 1;
    }
    &path[..end]
}

/// Join a directory (with or without a trailing slash) and an absolute or
/// relative suffix without doubling the separator.
pub fn join(dir: &str, suffix: &str) -> String {
    match (dir.ends_with('/'), suffix.starts_with('/')) {
        (true, true) => format!("{}{}", &dir[..dir.len() - 1], suffix),
        (false, false) => format!("{}/{}", dir, suffix),
        _ => format!("{}{}", dir, suffix),
    }
}

/// Quote `argument` for `sh -c` if it contains anything outside the safe
/// repertoire; single quotes inside are rendered as `'\''`.
pub fn shell_quote(argument: &str) -> String {
    let safe = |i: usize, c: u8| {
        (i != 0 || c != b'~')
            && (c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'~' | b'.' | b'/'))
    };
    if !argument.is_empty() && argument.bytes().enumerate().all(|(i, c)| safe(i, c)) {
        return argument.to_string();
    }
    let mut quoted = String::with_capacity(argument.len() + 2);
    quoted.push('\'');
    for c in argument.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_plain_absolute_paths() {
        assert_eq!(sanitize("/srv/jails/a").as_deref(), Some("/srv/jails/a"));
        assert_eq!(sanitize("/").as_deref(), Some("/"));
    }

    #[test]
    fn sanitize_collapses_dot_and_slash_runs() {
        assert_eq!(sanitize("/a/./b").as_deref(), Some("/a/b"));
        assert_eq!(sanitize("/a//b///c").as_deref(), Some("/a/b/c"));
        assert_eq!(sanitize("/a/b/.").as_deref(), Some("/a/b"));
        assert_eq!(sanitize("/a/b/").as_deref(), Some("/a/b"));
        assert_eq!(sanitize("/a/b//").as_deref(), Some("/a/b"));
    }

    #[test]
    fn sanitize_rejects_dotdot_and_bad_characters() {
        assert_eq!(sanitize("/a/../b"), None);
        assert_eq!(sanitize(".."), None);
        assert_eq!(sanitize("../x"), None);
        assert_eq!(sanitize("/a/.."), None);
        assert_eq!(sanitize(""), None);
        assert_eq!(sanitize("~root/x"), None);
        assert_eq!(sanitize("/a b"), None);
        assert_eq!(sanitize("/a\nb"), None);
        assert_eq!(sanitize("/a*"), None);
        // Dots that are not a ".." component are ordinary characters.
        assert_eq!(sanitize("/a..b/...").as_deref(), Some("/a..b/..."));
    }

    #[test]
    fn sanitize_rejects_overlong_names() {
        let long = "/".repeat(1) + &"a".repeat(1023);
        assert_eq!(sanitize(&long), None);
        let fits = "/".to_string() + &"a".repeat(1022);
        assert!(sanitize(&fits).is_some());
    }

    #[test]
    fn sanitize_is_idempotent() {
        for p in ["/a/./b//c/", "/x", "/", "relative/path", "/a/b/."] {
            if let Some(once) = sanitize(p) {
                assert_eq!(sanitize(&once).as_deref(), Some(once.as_str()));
            }
        }
    }

    #[test]
    fn slash_helpers() {
        assert_eq!(end_slash("/a"), "/a/");
        assert_eq!(end_slash("/a/"), "/a/");
        assert_eq!(no_end_slash("/a/"), "/a");
        assert_eq!(no_end_slash("/"), "/");
        assert_eq!(parent_dir("/a/b/c"), "/a/b/");
        assert_eq!(parent_dir("/a/b/c/"), "/a/b/");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(join("/jail/", "/bin/ls"), "/jail/bin/ls");
        assert_eq!(join("/jail", "bin/ls"), "/jail/bin/ls");
        assert_eq!(join("/jail/", "bin/ls"), "/jail/bin/ls");
    }

    #[test]
    fn quoting_matches_sh_expectations() {
        assert_eq!(shell_quote("plain-arg_1.txt"), "plain-arg_1.txt");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("don't"), "'don'\\''t'");
        assert_eq!(shell_quote("~user"), "'~user'");
        assert_eq!(shell_quote("mid~tilde"), "mid~tilde");
        assert_eq!(shell_quote(""), "''");
    }
}
