use crate::errors::GatewayError;

const ALLOWED: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Rejects anything that is not a single read-only statement.
///
/// Leading comments are skipped. A `;` is only allowed as the final
/// character; string literals are honoured when looking for it.
pub fn ensure_read_only(sql: &str) -> Result<(), GatewayError> {
    let body = strip_leading_comments(sql);
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if !ALLOWED.contains(&keyword.as_str()) {
        return Err(GatewayError::ReadOnlyViolation(format!(
            "statement starts with {:?}; only {} are permitted",
            keyword,
            ALLOWED.join("/")
        )));
    }

    if let Some(pos) = first_unquoted_semicolon(body) {
        if !body[pos + 1..].trim().is_empty() {
            return Err(GatewayError::ReadOnlyViolation(
                "multiple statements are not permitted".into(),
            ));
        }
    }
    Ok(())
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut s = sql.trim_start();
    loop {
        if let Some(rest) = s.strip_prefix("--") {
            s = rest.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = rest.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            return s;
        }
    }
}

pub(crate) fn first_unquoted_semicolon(sql: &str) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in sql.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => return Some(i),
            _ => {}
        }
    }
    None
}
