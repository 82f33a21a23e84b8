//! POSIX shell quoting for command lines executed inside an instance.

/// Escape single quotes within a string for use inside a single-quoted shell argument.
///
/// The caller is responsible for wrapping the result in single quotes.
pub fn shell_escape(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Quote a string for safe use as a shell argument.
///
/// Strings made only of characters the shell never interprets are returned
/// unchanged. Everything else is single-quoted. Empty strings become `''`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(is_inert) {
        s.to_string()
    } else {
        format!("'{}'", shell_escape(s))
    }
}

fn is_inert(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '+' | ',' | '=')
}

/// Quote every word and join them with spaces.
pub fn join_quoted<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the line sent to the remote shell: an optional prelude, a `cd` into
/// `workdir`, then `command` verbatim.
///
/// `command` is shell source chosen by the caller and is not quoted.
pub fn remote_line(prelude: Option<&str>, workdir: Option<&str>, command: &str) -> String {
    let mut line = String::new();
    if let Some(prelude) = prelude {
        line.push_str(prelude);
        line.push_str("; ");
    }
    if let Some(dir) = workdir {
        line.push_str(&format!("cd {} && ", shell_quote(dir)));
    }
    line.push_str(command);
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("/workspace/src/main.rs"), "/workspace/src/main.rs");
        assert_eq!(shell_quote("user@host:22"), "user@host:22");
    }

    #[test]
    fn quote_wraps_metacharacters() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn join_quoted_quotes_each_word() {
        assert_eq!(join_quoted(["ls", "-la", "my dir"]), "ls -la 'my dir'");
    }

    #[test]
    fn remote_line_runs_prelude_then_changes_directory() {
        assert_eq!(
            remote_line(Some("umask 022"), Some("/work space"), "python app.py"),
            "umask 022; cd '/work space' && python app.py"
        );
        assert_eq!(remote_line(None, None, "true"), "true");
    }
}
