//! Schema registry
//!
//! Maps a recognized file name to its column contract and destination table.
//! Built once at startup and read-only afterwards; the pipeline only ever
//! calls [`SchemaRegistry::lookup`].
//!
//! A registry can also be loaded from TOML:
//!
//! ```toml
//! [[contract]]
//! file_name = "grades.csv"
//! table = "Grades"
//! columns = ["StudentID", "Course", "Grade"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::types::FileReference;

/// Registry construction errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid SQL identifier '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidIdentifier(String),

    #[error("Contract for '{0}' has no columns")]
    EmptyColumns(String),

    #[error("Contract for '{file_name}' lists column '{column}' more than once")]
    DuplicateColumn { file_name: String, column: String },

    #[error("File name '{0}' is registered more than once")]
    DuplicateFileName(String),

    #[error("File name '{0}' must be a bare name without '/'")]
    InvalidFileName(String),

    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse schema file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Expected columns and destination for one file type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    table: String,
    columns: Vec<String>,
}

impl SchemaContract {
    pub fn new(table: impl Into<String>, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Destination table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Required columns; the order is the insert column order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "contract")]
    contracts: Vec<ContractEntry>,
}

#[derive(Debug, Deserialize)]
struct ContractEntry {
    file_name: String,
    table: String,
    columns: Vec<String>,
}

/// Immutable file name -> contract mapping
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    contracts: BTreeMap<String, SchemaContract>,
}

impl SchemaRegistry {
    /// The three deployed contracts
    pub fn builtin() -> Self {
        let contracts = [
            (
                "enrollment.csv",
                SchemaContract::new(
                    "Enrollment",
                    ["StudentID", "Name", "Program", "EnrollmentDate", "Department"],
                ),
            ),
            (
                "attendance.csv",
                SchemaContract::new("Attendance", ["StudentID", "Date", "Status"]),
            ),
            (
                "grades.csv",
                SchemaContract::new("Grades", ["StudentID", "Course", "Grade"]),
            ),
        ]
        .into_iter()
        .map(|(name, contract)| (name.to_string(), contract))
        .collect();

        Self { contracts }
    }

    /// Build a registry, validating every contract
    pub fn new<I>(entries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, SchemaContract)>,
    {
        let mut contracts = BTreeMap::new();

        for (file_name, contract) in entries {
            validate_contract(&file_name, &contract)?;
            if contracts.insert(file_name.clone(), contract).is_some() {
                return Err(RegistryError::DuplicateFileName(file_name));
            }
        }

        Ok(Self { contracts })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(content)?;
        Self::new(
            file.contracts
                .into_iter()
                .map(|entry| (entry.file_name, SchemaContract::new(entry.table, entry.columns))),
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Exact, case-sensitive match on the reference's final path segment
    pub fn lookup(&self, file: &FileReference) -> Option<&SchemaContract> {
        self.contracts.get(file.file_name())
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Contracts ordered by file name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SchemaContract)> {
        self.contracts.iter().map(|(name, contract)| (name.as_str(), contract))
    }
}

fn validate_contract(file_name: &str, contract: &SchemaContract) -> Result<(), RegistryError> {
    if file_name.is_empty() || file_name.contains('/') {
        return Err(RegistryError::InvalidFileName(file_name.to_string()));
    }

    validate_identifier(contract.table())?;

    if contract.columns().is_empty() {
        return Err(RegistryError::EmptyColumns(file_name.to_string()));
    }

    let mut seen = HashSet::new();
    for column in contract.columns() {
        validate_identifier(column)?;
        if !seen.insert(column.as_str()) {
            return Err(RegistryError::DuplicateColumn {
                file_name: file_name.to_string(),
                column: column.clone(),
            });
        }
    }

    Ok(())
}

/// Names are interpolated into INSERT statements, so only plain identifiers pass
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    }
}

fn validate_identifier(name: &str) -> Result<(), RegistryError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(name.to_string()))
    }
}
