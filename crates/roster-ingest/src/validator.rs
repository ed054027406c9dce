//! Schema validation
//!
//! Turns raw CSV bytes into rows ordered by the contract. Validation is
//! all-or-nothing over the file: the header's column set must equal the
//! contract's set exactly, and a single bad row rejects the whole file.

use csv::{ReaderBuilder, StringRecord};
use std::collections::HashSet;

use crate::error::SchemaError;
use crate::registry::SchemaContract;
use crate::types::ParsedRow;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Parse `bytes` against `contract`.
///
/// Header order in the file is irrelevant; values are projected into the
/// contract's column order by name. A header-only file yields no rows.
pub fn parse(bytes: &[u8], contract: &SchemaContract) -> Result<Vec<ParsedRow>, SchemaError> {
    let data = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(data);

    let header = reader.headers().map_err(|e| malformed(&e, 1))?.clone();
    let projection = project_header(&header, contract)?;

    let mut rows = Vec::new();
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                rows.push(project_row(&record, &projection, line)?);
            },
            Ok(false) => break,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                return Err(malformed(&e, line));
            },
        }
    }

    Ok(rows)
}

/// Map each contract column to its position in the file header
fn project_header(header: &StringRecord, contract: &SchemaContract) -> Result<Vec<usize>, SchemaError> {
    let found: Vec<String> = header
        .iter()
        .map(str::to_string)
        .filter(|name| !(header.len() == 1 && name.is_empty()))
        .collect();

    let mismatch = || SchemaError::ColumnMismatch {
        expected: contract.columns().to_vec(),
        found: found.clone(),
    };

    let unique: HashSet<&str> = found.iter().map(String::as_str).collect();
    if unique.len() != found.len() || found.len() != contract.columns().len() {
        return Err(mismatch());
    }

    contract
        .columns()
        .iter()
        .map(|column| header.iter().position(|name| name == column.as_str()).ok_or_else(mismatch))
        .collect()
}

fn project_row(record: &StringRecord, projection: &[usize], line: u64) -> Result<ParsedRow, SchemaError> {
    projection
        .iter()
        .map(|&index| {
            record.get(index).map(str::to_string).ok_or_else(|| SchemaError::MalformedRow {
                line,
                reason: format!("missing field {}", index + 1),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ParsedRow::new)
}

fn malformed(err: &csv::Error, line: u64) -> SchemaError {
    let reason = match err.kind() {
        csv::ErrorKind::UnequalLengths { expected_len, len, .. } => {
            format!("expected {} fields, found {}", expected_len, len)
        },
        csv::ErrorKind::Utf8 { err, .. } => format!("invalid UTF-8: {}", err),
        _ => err.to_string(),
    };
    SchemaError::MalformedRow { line, reason }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn attendance() -> SchemaContract {
        SchemaContract::new("Attendance", ["StudentID", "Date", "Status"])
    }

    fn values(rows: &[ParsedRow]) -> Vec<Vec<&str>> {
        rows.iter()
            .map(|row| row.values().iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_parse_in_contract_order() {
        let csv = b"StudentID,Date,Status\n1001,2024-09-02,Present\n1002,2024-09-02,Absent\n";
        let rows = parse(csv, &attendance()).unwrap();
        assert_eq!(
            values(&rows),
            vec![
                vec!["1001", "2024-09-02", "Present"],
                vec!["1002", "2024-09-02", "Absent"],
            ]
        );
    }

    #[test]
    fn test_reordered_header_projects_by_name() {
        let csv = b"Status,StudentID,Date\nPresent,1001,2024-09-02\n";
        let rows = parse(csv, &attendance()).unwrap();
        assert_eq!(values(&rows), vec![vec!["1001", "2024-09-02", "Present"]]);
    }

    #[test]
    fn test_enrollment_name_first() {
        let contract = SchemaContract::new(
            "Enrollment",
            ["StudentID", "Name", "Program", "EnrollmentDate", "Department"],
        );
        let csv = b"Name,StudentID,Program,EnrollmentDate,Department\nAda Lovelace,S-17,BSc,2024-08-01,CSE\n";
        let rows = parse(csv, &contract).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some("S-17"));
        assert_eq!(rows[0].get(1), Some("Ada Lovelace"));
    }

    #[test]
    fn test_missing_column_rejected() {
        let err = parse(b"StudentID,Date\n1,2024-01-01\n", &attendance()).unwrap_err();
        match err {
            SchemaError::ColumnMismatch { expected, found } => {
                assert_eq!(expected, ["StudentID", "Date", "Status"]);
                assert_eq!(found, ["StudentID", "Date"]);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_extra_column_rejected() {
        let err = parse(b"StudentID,Date,Status,Note\n1,d,Present,x\n", &attendance()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        // Same count as the contract but one required name is replaced by a duplicate.
        let err = parse(b"StudentID,Date,Date\n1,d,d\n", &attendance()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnMismatch { .. }));

        // Every required column present plus a duplicate of one of them.
        let err = parse(b"StudentID,Date,Status,Status\n1,d,P,P\n", &attendance()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_header_match_is_case_sensitive() {
        let err = parse(b"studentid,Date,Status\n", &attendance()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_padded_header_name_is_column_mismatch() {
        match parse(b" StudentID ,Date,Status\n1,d,Present\n", &attendance()).unwrap_err() {
            SchemaError::ColumnMismatch { found, .. } => {
                assert_eq!(found, vec![" StudentID ", "Date", "Status"]);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_header_only_yields_no_rows() {
        let rows = parse(b"StudentID,Date,Status\n", &attendance()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_empty_file_is_column_mismatch() {
        match parse(b"", &attendance()).unwrap_err() {
            SchemaError::ColumnMismatch { found, .. } => assert!(found.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_short_row_rejects_file() {
        let csv = b"StudentID,Date,Status\n1,d,Present\n2,d\n3,d,Absent\n";
        match parse(csv, &attendance()).unwrap_err() {
            SchemaError::MalformedRow { line, reason } => {
                assert_eq!(line, 3);
                assert!(reason.contains("expected 3 fields, found 2"), "{reason}");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_long_row_rejects_file() {
        let csv = b"StudentID,Date,Status\n1,d,Present,extra\n";
        assert!(matches!(
            parse(csv, &attendance()),
            Err(SchemaError::MalformedRow { line: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejects_file() {
        let csv = b"StudentID,Date,Status\n1,d,Pr\xFFsent\n";
        assert!(matches!(
            parse(csv, &attendance()),
            Err(SchemaError::MalformedRow { .. })
        ));
    }

    #[test]
    fn test_bom_and_crlf() {
        let csv = b"\xEF\xBB\xBFStudentID,Date,Status\r\n1,d,Present\r\n";
        let rows = parse(csv, &attendance()).unwrap();
        assert_eq!(values(&rows), vec![vec!["1", "d", "Present"]]);
    }

    #[test]
    fn test_quoted_fields_and_blank_lines() {
        let csv = b"StudentID,Date,Status\n\n\"1\",\"2024-09-02\",\"Present, late\"\n\n";
        let rows = parse(csv, &attendance()).unwrap();
        assert_eq!(values(&rows), vec![vec!["1", "2024-09-02", "Present, late"]]);
    }

    #[test]
    fn test_empty_values_are_kept() {
        let rows = parse(b"StudentID,Date,Status\n1,,Absent\n", &attendance()).unwrap();
        assert_eq!(rows[0].get(1), Some(""));
    }
}
