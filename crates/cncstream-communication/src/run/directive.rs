//! Compilation of program lines into queue items
//!
//! Recognized directives:
//!
//! | Line | Item |
//! |---|---|
//! | `%wait` | wait barrier |
//! | `%update <key>` | generic-update event for `key` |
//! | `%msg <text>` | run message event |
//! | `%global k; k=<expr>; ...` | assignments (declarations are skipped) |
//! | `%k=<expr>` | assignment |
//! | `%` | nothing (tape marker) |
//!
//! Any other line becomes a template whose `[<expr>]` segments are filled
//! in when the line is dequeued.

use cncstream_core::{Expr, RunError};

use crate::queue::{LineTemplate, QueueItem, QueueItemKind};

/// Remove `( )` and `;` comments, leaving `[ ]` expressions intact
///
/// On `%` directive lines `;` separates statements, so only `( )` comments go.
pub fn strip_comments(line: &str) -> String {
    let directive = line.trim_start().starts_with('%');
    let mut out = String::with_capacity(line.len());
    let mut paren = 0usize;
    let mut bracket = 0usize;
    for c in line.chars() {
        match c {
            '(' if bracket == 0 => paren += 1,
            ')' if paren > 0 => paren -= 1,
            _ if paren > 0 => {}
            ';' if bracket == 0 && !directive => break,
            '[' => {
                bracket += 1;
                out.push(c);
            }
            ']' => {
                bracket = bracket.saturating_sub(1);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Keyword followed by whitespace or end of text
fn keyword<'a>(body: &'a str, word: &str) -> Option<&'a str> {
    let rest = body.strip_prefix(word)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn parse_assignments(
    statements: &str,
    index: usize,
    directive: &str,
) -> Result<Vec<(String, Expr)>, RunError> {
    let invalid = || RunError::InvalidDirective {
        index,
        directive: directive.to_string(),
    };
    let mut out = Vec::new();
    for statement in statements.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, expr)) = statement.split_once('=') else {
            // Bare names declare globals
            if statement.split_whitespace().all(is_identifier) {
                continue;
            }
            return Err(invalid());
        };
        let name = name.trim();
        if !is_identifier(name) {
            return Err(invalid());
        }
        let expr = Expr::parse(expr.trim())
            .map_err(|source| RunError::InvalidExpression { index, source })?;
        out.push((name.to_string(), expr));
    }
    Ok(out)
}

/// Parse the text after `%`
pub fn parse_directive(body: &str, index: usize) -> Result<QueueItemKind, RunError> {
    let body = body.trim();
    let directive = format!("%{}", body);
    let invalid = || RunError::InvalidDirective {
        index,
        directive: directive.clone(),
    };

    if keyword(body, "wait").is_some_and(str::is_empty) {
        return Ok(QueueItemKind::Wait);
    }
    if let Some(key) = keyword(body, "update") {
        if !is_identifier(key) {
            return Err(invalid());
        }
        return Ok(QueueItemKind::Update(key.to_string()));
    }
    if let Some(text) = keyword(body, "msg") {
        return Ok(QueueItemKind::Message(text.to_string()));
    }
    if let Some(statements) = keyword(body, "global") {
        return Ok(QueueItemKind::Assign(parse_assignments(
            statements, index, &directive,
        )?));
    }
    if body.contains('=') {
        return Ok(QueueItemKind::Assign(parse_assignments(body, index, &directive)?));
    }
    Err(invalid())
}

/// Compile one program line; blank, comment-only and bare `%` lines yield `None`
pub fn compile_line(raw: &str, index: usize, run: Option<u64>) -> Result<Option<QueueItem>, RunError> {
    let line = strip_comments(raw);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let kind = match line.strip_prefix('%') {
        Some(body) if body.trim().is_empty() => return Ok(None),
        Some(body) => parse_directive(body, index)?,
        None => QueueItemKind::Line(
            LineTemplate::parse(line)
                .map_err(|source| RunError::InvalidExpression { index, source })?,
        ),
    };
    Ok(Some(QueueItem::new(kind, run, Some(index))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("G0 X1 (rapid) Y2"), "G0 X1  Y2");
        assert_eq!(strip_comments("G1 X[a] ; trailing"), "G1 X[a] ");
        assert_eq!(strip_comments("G0 Z[(1+2)*3]"), "G0 Z[(1+2)*3]");
        assert_eq!(strip_comments("(only a comment)"), "");
    }

    #[test]
    fn test_directive_keeps_statement_separators() {
        assert_eq!(
            strip_comments("%global _x; _x=wx; _y=wy"),
            "%global _x; _x=wx; _y=wy"
        );
        assert_eq!(strip_comments("  %x=1 (note); y=2"), "  %x=1 ; y=2");
    }

    #[test]
    fn test_parse_wait_update_msg() {
        assert_eq!(parse_directive("wait", 0).unwrap(), QueueItemKind::Wait);
        assert_eq!(
            parse_directive("update TLO", 0).unwrap(),
            QueueItemKind::Update("TLO".into())
        );
        assert_eq!(
            parse_directive("msg Tool change T01", 0).unwrap(),
            QueueItemKind::Message("Tool change T01".into())
        );
    }

    #[test]
    fn test_parse_global_assignments() {
        let QueueItemKind::Assign(statements) =
            parse_directive("global _x; _x=wx; _y=wy+1", 3).unwrap()
        else {
            panic!("expected an assignment");
        };
        let names: Vec<_> = statements.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["_x", "_y"]);
    }

    #[test]
    fn test_short_assignment() {
        assert!(matches!(
            parse_directive("toolheight = wz", 0).unwrap(),
            QueueItemKind::Assign(ref s) if s.len() == 1
        ));
    }

    #[test]
    fn test_invalid_directives() {
        assert!(matches!(
            parse_directive("waitfor", 4),
            Err(RunError::InvalidDirective { index: 4, .. })
        ));
        assert!(matches!(
            parse_directive("update", 1),
            Err(RunError::InvalidDirective { index: 1, .. })
        ));
        assert!(matches!(
            parse_directive("x = 1 +", 2),
            Err(RunError::InvalidExpression { index: 2, .. })
        ));
        assert!(matches!(
            parse_directive("2x = 1", 0),
            Err(RunError::InvalidDirective { .. })
        ));
    }

    #[test]
    fn test_compile_line() {
        assert!(compile_line("   ; nothing", 0, None).unwrap().is_none());
        let item = compile_line("G0 X[_x] (back)", 5, Some(2)).unwrap().unwrap();
        assert_eq!(item.run, Some(2));
        assert_eq!(item.index, Some(5));
        assert!(matches!(item.kind, QueueItemKind::Line(ref t) if !t.is_literal()));
        assert!(matches!(
            compile_line("G0 X[1+]", 7, None),
            Err(RunError::InvalidExpression { index: 7, .. })
        ));
    }

    #[test]
    fn test_compile_global_line_keeps_every_assignment() {
        let item = compile_line("%global _x; _x=wx; _y=wy; _z=wz", 0, None)
            .unwrap()
            .unwrap();
        let QueueItemKind::Assign(statements) = item.kind else {
            panic!("expected an assignment");
        };
        let names: Vec<_> = statements.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["_x", "_y", "_z"]);

        let item = compile_line("%global TLO; TLO=prbz-toolmz", 0, None)
            .unwrap()
            .unwrap();
        assert!(matches!(item.kind, QueueItemKind::Assign(ref s) if s.len() == 1 && s[0].0 == "TLO"));
    }

    #[test]
    fn test_tape_marker_is_skipped() {
        assert!(compile_line("%", 0, None).unwrap().is_none());
        assert!(compile_line("  %  ", 3, Some(1)).unwrap().is_none());
        assert!(compile_line("% (start of tape)", 0, None).unwrap().is_none());
    }
}
