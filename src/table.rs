//! Markdown-style text tables from string rows.

/// Render `rows` as a pipe-delimited table.
///
/// The first row is the header. A dash row follows it, holding as many dashes
/// as the header cells have characters in total, with no separators. Rows are
/// assumed rectangular.
///
/// Returns the whole block (one `\n`-terminated line per row, plus the dash
/// row) and the same lines without terminators. Each line is also logged at
/// debug level.
///
/// ```
/// use keysight_smu::table::markdown_table;
///
/// let rows = vec![
///     vec!["a".to_string(), "bb".to_string()],
///     vec!["ccc".to_string(), "d".to_string()],
/// ];
/// let (block, lines) = markdown_table(&rows);
/// assert_eq!(block, "a|bb\n---\nccc|d\n");
/// assert_eq!(lines[1].len(), 3);
/// assert_eq!(lines.len(), 3);
/// ```
#[must_use]
pub fn markdown_table<S: AsRef<str>>(rows: &[Vec<S>]) -> (String, Vec<String>) {
    let mut lines = Vec::with_capacity(rows.len() + 1);

    for (i, row) in rows.iter().enumerate() {
        lines.push(
            row.iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join("|"),
        );
        if i == 0 {
            lines.push(
                row.iter()
                    .map(|cell| "-".repeat(cell.as_ref().chars().count()))
                    .collect::<String>(),
            );
        }
    }

    let mut block = String::new();
    for line in &lines {
        tracing::debug!("{}", line);
        block.push_str(line);
        block.push('\n');
    }
    (block, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn rows(cells: &[&[&str]]) -> Vec<Vec<String>> {
        cells
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_dash_row_matches_header_widths() {
        let (block, lines) = markdown_table(&rows(&[&["a", "bb"], &["ccc", "d"]]));
        assert_eq!(lines, vec!["a|bb", "---", "ccc|d"]);
        assert_eq!(lines[1].len(), 1 + 2);
        assert_eq!(block, "a|bb\n---\nccc|d\n");
    }

    #[test]
    fn test_line_count_is_rows_plus_one() {
        let data = rows(&[
            &["step", "V"],
            &["0", "1.8"],
            &["1", "1.805"],
            &["2", "1.81"],
        ]);
        let (block, lines) = markdown_table(&data);
        assert_eq!(lines.len(), data.len() + 1);
        assert_eq!(block.lines().count(), data.len() + 1);
        assert_eq!(lines[1], "-----");
    }

    #[test]
    fn test_header_only_and_empty() {
        let (block, lines) = markdown_table(&rows(&[&["x"]]));
        assert_eq!(lines, vec!["x", "-"]);
        assert_eq!(block, "x\n-\n");

        let (block, lines) = markdown_table::<String>(&[]);
        assert!(block.is_empty());
        assert!(lines.is_empty());
    }

    #[test]
    fn test_accepts_str_rows() {
        let data = vec![vec!["µA", "V"], vec!["1", "2"]];
        let (_, lines) = markdown_table(&data);
        assert_eq!(lines[1], "---");
    }

    #[traced_test]
    #[test]
    fn test_lines_are_logged() {
        let _ = markdown_table(&rows(&[&["voltage", "current"], &["1.8", "0.002"]]));
        assert!(logs_contain("voltage|current"));
        assert!(logs_contain("1.8|0.002"));
    }
}
