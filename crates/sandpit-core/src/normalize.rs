//! Line-based statement termination
//!
//! A heuristic, not a parser. Each physical line that does not already end
//! in a safe terminator gets a `;` appended. This can corrupt expressions
//! that legitimately continue on the next line, for example:
//!
//! ```text
//! const total = items
//!   .map(price)      // becomes `items;` and breaks the chain
//! ```
//!
//! Operators at end of line and multi-line template literals break the same
//! way. Callers that hit this can disable normalization in `SandboxConfig`.

/// Line endings that already terminate or continue a statement
const SAFE_TERMINATORS: [&str; 6] = [";", "{", "}", ":", ",", "*/"];

/// Append statement terminators where a line lacks one
#[must_use]
pub fn normalize(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + source.len() / 16);

    for (i, line) in source.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }

        // keep CRLF input intact
        let (body, cr) = line
            .strip_suffix('\r')
            .map_or((line, ""), |stripped| (stripped, "\r"));

        out.push_str(body);
        if needs_terminator(body) {
            out.push(';');
        }
        out.push_str(cr);
    }

    out
}

fn needs_terminator(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || is_comment_only(trimmed) {
        return false;
    }

    let end = trimmed.trim_end();
    !SAFE_TERMINATORS.iter().any(|t| end.ends_with(t))
}

fn is_comment_only(trimmed: &str) -> bool {
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}
