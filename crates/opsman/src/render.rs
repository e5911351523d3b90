//! Console rendering helpers: aligned tables and colored status cells.

use console::style;
use ops_proto::Status;
use serde::Serialize;

/// Render a plain aligned table. Columns are padded to the widest cell,
/// separated by two spaces, with a dashed rule under the header.
pub fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    for (i, h) in header.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(&format!("{:<w$}", h, w = widths[i]));
    }
    out.push('\n');
    for (i, w) in widths.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(&"-".repeat(*w));
    }
    out.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            if i > 0 {
                out.push_str("  ");
            }
            out.push_str(&format!("{:<w$}", cell, w = widths[i]));
        }
        out.push('\n');
    }
    out
}

/// Render rows as a pretty-printed JSON array, newline-terminated. The
/// machine-readable counterpart of [`render_table`].
pub fn render_json<T: Serialize>(rows: &[T]) -> String {
    let mut out = serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string());
    out.push('\n');
    out
}

/// Colored status token: green running, red failed, yellow stopped.
pub fn styled_status(status: Status) -> String {
    match status {
        Status::Running => style("running").green().to_string(),
        Status::Failed => style("failed").red().to_string(),
        Status::Stopped => style("stopped").yellow().to_string(),
        Status::Unknown => style("unknown").dim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_alignment() {
        let out = render_table(
            &["NAME", "HOSTS"],
            &[
                vec!["apache".to_string(), "-".to_string()],
                vec!["web".to_string(), "node1, node2".to_string()],
            ],
        );

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "NAME    HOSTS");
        assert_eq!(lines[1], "------  ------------");
        assert_eq!(lines[2], "apache  -");
        assert_eq!(lines[3], "web     node1, node2");
    }

    #[test]
    fn test_render_table_empty_rows() {
        let out = render_table(&["NAME"], &[]);
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn test_render_json_round_trips_rows() {
        use ops_proto::InstanceStatus;

        let rows = vec![
            InstanceStatus::new("node1", Status::Running),
            InstanceStatus::failed("node2"),
        ];
        let out = render_json(&rows);
        assert!(out.contains(r#""hostname": "node1""#));
        assert!(out.ends_with('\n'));

        let back: Vec<InstanceStatus> = serde_json::from_str(&out).expect("parse");
        assert_eq!(back, rows);
    }

    #[test]
    fn test_render_json_empty_rows() {
        let out = render_json(&Vec::<ops_proto::InstanceStatus>::new());
        assert_eq!(out, "[]\n");
    }

    #[test]
    fn test_styled_status_contains_token() {
        // Styling may be a no-op without a tty; the token must survive.
        assert!(styled_status(Status::Running).contains("running"));
        assert!(styled_status(Status::Failed).contains("failed"));
    }
}
