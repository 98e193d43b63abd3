use crate::config::OutputFormat;
use crate::template::{Align, ColumnConfig};

/// Replaces CR and LF with spaces so a value can never break the
/// one-row-per-line contract of spool files.
pub fn sanitize(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

/// Renders one row of values according to the run's output format.
///
/// Delimited mode joins the sanitized values with the configured delimiter
/// and ignores column lengths. Fixed mode truncates each value to its
/// column length (keeping the left side) and pads with spaces; alignment
/// counts characters, not bytes.
pub fn format_row(
    format: OutputFormat,
    delimiter: &str,
    columns: &[ColumnConfig],
    values: &[String],
) -> String {
    match format {
        OutputFormat::Delimited => {
            let mut line = String::new();
            for (idx, value) in values.iter().enumerate() {
                if idx > 0 {
                    line.push_str(delimiter);
                }
                line.push_str(&sanitize(value));
            }
            line
        }
        OutputFormat::Fixed => {
            let mut line = String::new();
            for (idx, column) in columns.iter().enumerate() {
                let raw = values.get(idx).map(String::as_str).unwrap_or("");
                let value = sanitize(raw);
                line.push_str(&pad(&value, column.length, column.align));
            }
            line
        }
    }
}

fn pad(value: &str, length: usize, align: Align) -> String {
    let truncated: String = value.chars().take(length).collect();
    let fill = length.saturating_sub(truncated.chars().count());
    match align {
        Align::Left => format!("{truncated}{}", " ".repeat(fill)),
        Align::Right => format!("{}{truncated}", " ".repeat(fill)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, length: usize, align: Align) -> ColumnConfig {
        ColumnConfig {
            name: name.to_string(),
            length,
            align,
        }
    }

    #[test]
    fn sanitize_replaces_cr_and_lf() {
        assert_eq!(sanitize("a\nb\rc"), "a b c");
        assert_eq!(sanitize("clean"), "clean");
    }

    #[test]
    fn delimited_joins_with_delimiter() {
        let columns = vec![col("A", 0, Align::Left), col("B", 0, Align::Left)];
        let line = format_row(
            OutputFormat::Delimited,
            "|",
            &columns,
            &["a\nb\rc".to_string(), "second".to_string()],
        );
        assert_eq!(line, "a b c|second");
    }

    #[test]
    fn fixed_width_truncates_and_pads() {
        let columns = vec![
            col("Name", 5, Align::Left),
            col("Amt", 6, Align::Right),
        ];
        let line = format_row(
            OutputFormat::Fixed,
            "",
            &columns,
            &["Alexander".to_string(), "42".to_string()],
        );
        assert_eq!(line, "Alexa    42");
        assert_eq!(line.len(), 11);
    }

    #[test]
    fn fixed_width_missing_values_become_blank() {
        let columns = vec![col("A", 3, Align::Left), col("B", 2, Align::Right)];
        let line = format_row(OutputFormat::Fixed, "", &columns, &["x".to_string()]);
        assert_eq!(line, "x    ");
    }

    #[test]
    fn exact_length_values_survive_fixed_round_trip() {
        let columns = vec![
            col("A", 4, Align::Left),
            col("B", 3, Align::Left),
        ];
        let values = vec!["wxyz".to_string(), "abc".to_string()];
        let line = format_row(OutputFormat::Fixed, "", &columns, &values);

        let mut offset = 0;
        for (column, original) in columns.iter().zip(&values) {
            let slice: String = line.chars().skip(offset).take(column.length).collect();
            assert_eq!(slice.trim_end(), original);
            offset += column.length;
        }
    }

    #[test]
    fn padding_counts_characters_not_bytes() {
        let columns = vec![col("A", 4, Align::Left)];
        let line = format_row(OutputFormat::Fixed, "", &columns, &["ふじ".to_string()]);
        assert_eq!(line.chars().count(), 4);
    }
}
