use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid template {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("template {} has no 'name' column", .path.display())]
    MissingNameColumn { path: PathBuf },
    #[error("template {} defines no columns", .path.display())]
    Empty { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    Left,
    Right,
}

impl Align {
    fn from_raw(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("right") {
            Align::Right
        } else {
            Align::Left
        }
    }
}

/// One column of a procedure's output template. `length` only matters for
/// fixed-width rendering; `align` defaults to left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConfig {
    pub name: String,
    pub length: usize,
    pub align: Align,
}

/// Column templates keyed by procedure name.
pub type TemplateMap = HashMap<String, Vec<ColumnConfig>>;

fn map_csv_error(path: &Path, err: csv::Error) -> TemplateError {
    if err.is_io_error() {
        if let csv::ErrorKind::Io(source) = err.into_kind() {
            return TemplateError::Io {
                path: path.to_path_buf(),
                source,
            };
        }
        unreachable!("is_io_error guaranteed an io kind");
    }
    TemplateError::Csv {
        path: path.to_path_buf(),
        source: err,
    }
}

/// Reads a single `<procedure>.csv` template. The header must contain a
/// `name` column; `length` and `align` are optional and any other columns
/// are ignored.
pub fn read_columns(path: &Path) -> Result<Vec<ColumnConfig>, TemplateError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| map_csv_error(path, err))?;

    let headers = reader
        .headers()
        .map_err(|err| map_csv_error(path, err))?;
    let mut name_idx = None;
    let mut length_idx = None;
    let mut align_idx = None;
    for (idx, header) in headers.iter().enumerate() {
        match header.to_ascii_lowercase().as_str() {
            "name" => name_idx = Some(idx),
            "length" => length_idx = Some(idx),
            "align" => align_idx = Some(idx),
            _ => {}
        }
    }
    let name_idx = name_idx.ok_or_else(|| TemplateError::MissingNameColumn {
        path: path.to_path_buf(),
    })?;

    let mut columns = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| map_csv_error(path, err))?;
        let Some(name) = record.get(name_idx).filter(|n| !n.is_empty()) else {
            continue;
        };
        let length = length_idx
            .and_then(|idx| record.get(idx))
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(0);
        let align = align_idx
            .and_then(|idx| record.get(idx))
            .map(Align::from_raw)
            .unwrap_or_default();
        columns.push(ColumnConfig {
            name: name.to_string(),
            length,
            align,
        });
    }

    if columns.is_empty() {
        return Err(TemplateError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(columns)
}

/// Loads templates for every configured procedure from
/// `<template_path>/<procedure>.csv`. Any missing or unreadable template is
/// fatal: extraction cannot build its SELECT list without one.
pub fn load_templates(
    procedures: &[String],
    template_path: &Path,
) -> Result<TemplateMap, TemplateError> {
    let mut templates = TemplateMap::with_capacity(procedures.len());
    for procedure in procedures {
        let path = template_path.join(format!("{procedure}.csv"));
        let columns = read_columns(&path)?;
        templates.insert(procedure.clone(), columns);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_template(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_name_length_align() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "ACCT_BAL.csv",
            "name,length,align\nACCT_NO,12,left\nBALANCE,15,right\n",
        );

        let columns = read_columns(&path).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "ACCT_NO");
        assert_eq!(columns[0].length, 12);
        assert_eq!(columns[0].align, Align::Left);
        assert_eq!(columns[1].align, Align::Right);
    }

    #[test]
    fn unknown_header_columns_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "GL_TXN.csv",
            "name,length,align,comment\nTXN_ID,10,,primary key\nAMT,8,right,\n",
        );

        let columns = read_columns(&path).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "TXN_ID");
        assert_eq!(columns[0].align, Align::Left);
        assert_eq!(columns[1].name, "AMT");
        assert_eq!(columns[1].align, Align::Right);
    }

    #[test]
    fn name_only_header_defaults_length_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "SIMPLE.csv", "name\nCOL_A\nCOL_B\n");

        let columns = read_columns(&path).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].length, 0);
    }

    #[test]
    fn missing_template_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_columns(&dir.path().join("NOPE.csv")).unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }

    #[test]
    fn header_without_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "BAD.csv", "col,length\nA,3\n");
        let err = read_columns(&path).unwrap_err();
        assert!(matches!(err, TemplateError::MissingNameColumn { .. }));
    }

    #[test]
    fn template_with_no_rows_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "EMPTY.csv", "name,length\n");
        let err = read_columns(&path).unwrap_err();
        assert!(matches!(err, TemplateError::Empty { .. }));
    }

    #[test]
    fn load_templates_reads_each_procedure() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "A.csv", "name\nX\n");
        write_template(dir.path(), "B.csv", "name,length\nY,4\n");

        let templates =
            load_templates(&["A".to_string(), "B".to_string()], dir.path()).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates["B"][0].length, 4);
    }

    #[test]
    fn load_templates_fails_on_missing_procedure() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "A.csv", "name\nX\n");

        let err = load_templates(&["A".to_string(), "MISSING".to_string()], dir.path())
            .unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }
}
