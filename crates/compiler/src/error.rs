//! Compile diagnostics.
//!
//! Errors are returned as structured values; the front end decides where
//! they go. [`render`] produces the classic caret report: heading, the
//! offending source line, an underline, and a hint for the error kind.

use crux_core::ErrorKind;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: u32,
    /// Byte offset of the offending token in the source.
    pub start: usize,
    pub len: usize,
}

pub fn render(source: &str, error: &CompileError) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}: {} at line {}\n",
        error.kind.display_name(),
        error.message,
        error.line
    ));

    if let Some((line_start, line_text)) = source_line(source, error.start) {
        let line_label = error.line.to_string();
        out.push_str(&format!("{} | {}\n", line_label, line_text));
        let column = error.start.saturating_sub(line_start);
        let mut underline = String::new();
        for c in line_text.chars().take(column) {
            underline.push(if c == '\t' { '\t' } else { ' ' });
        }
        underline.push('^');
        for _ in 1..error.len.max(1) {
            underline.push('~');
        }
        out.push_str(&format!("{} | {}\n", " ".repeat(line_label.len()), underline));
    }

    out.push_str(&format!("{}\n", error.kind.hint()));
    out
}

/// Returns the start offset and text of the line containing `offset`.
fn source_line(source: &str, offset: usize) -> Option<(usize, &str)> {
    if offset > source.len() {
        return None;
    }
    let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    let line_end = source[line_start..]
        .find('\n')
        .map_or(source.len(), |i| line_start + i);
    Some((line_start, &source[line_start..line_end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_points_at_token() {
        let source = "let x = ;\nlet y = 2;";
        let error = CompileError {
            kind: ErrorKind::Syntax,
            message: "Expected expression.".to_string(),
            line: 1,
            start: 8,
            len: 1,
        };
        let report = render(source, &error);
        assert!(report.contains("Syntax Error"));
        assert!(report.contains("let x = ;"));
        assert!(report.contains("^"));
        assert!(!report.contains("let y"));
    }

    #[test]
    fn test_render_second_line() {
        let source = "let a = 1;\nlet a = ;";
        let error = CompileError {
            kind: ErrorKind::Syntax,
            message: "Expected expression.".to_string(),
            line: 2,
            start: 19,
            len: 1,
        };
        let report = render(source, &error);
        assert!(report.contains("2 | let a = ;"));
    }
}
