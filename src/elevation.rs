//! Wraps shell command lines so that running them raises exactly one
//! administrator credential prompt, however many sub-commands they chain.

pub const OSASCRIPT: &str = "/usr/bin/osascript";

/// Escapes `command` for an AppleScript string literal and embeds it in a
/// `do shell script ... with administrator privileges` statement.
pub fn wrap_for_elevation(command: &str) -> String {
    format!(
        "do shell script \"{}\" with administrator privileges",
        escape_applescript(command)
    )
}

fn escape_applescript(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}

/// Shell-safe single quoting: `foo'bar` becomes `'foo'\''bar'`.
pub fn shell_single_quote(value: &str) -> String {
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
