//! Declarative table and column descriptors
//!
//! Descriptors are assembled with consuming builder methods and are immutable
//! afterwards. Each column projects its flags into a SQLite constraint
//! fragment and validates candidate values before they reach the store.

use serde_json::{Map, Value};

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            // SQLite has no boolean storage class
            ColumnType::Boolean => "INTEGER",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnType::Integer => value.is_i64() || value.is_u64(),
            ColumnType::Real => value.is_number(),
            ColumnType::Text => value.is_string(),
            ColumnType::Boolean => value.is_boolean() || matches!(value.as_i64(), Some(0 | 1)),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ColumnType::Integer => "an integer",
            ColumnType::Real => "a number",
            ColumnType::Text => "a string",
            ColumnType::Boolean => "a boolean",
        }
    }
}

/// A single column declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    ty: ColumnType,
    required: bool,
    unique: bool,
    primary: bool,
    auto_increment: bool,
    max_len: Option<usize>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            unique: false,
            primary: false,
            auto_increment: false,
            max_len: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    /// Reject null or missing values
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Store-assigned key; implies `primary`
    pub fn auto_increment(mut self) -> Self {
        self.primary = true;
        self.auto_increment = true;
        self
    }

    /// Maximum length in characters for text columns
    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.ty
    }

    /// Constraint clause for this column, empty when unconstrained
    pub fn constraint_fragment(&self) -> String {
        let mut parts = Vec::new();
        if self.primary {
            parts.push("PRIMARY KEY");
            if self.auto_increment {
                parts.push("AUTOINCREMENT");
            }
        }
        if self.required && !self.primary {
            parts.push("NOT NULL");
        }
        if self.unique && !self.primary {
            parts.push("UNIQUE");
        }
        parts.join(" ")
    }

    /// Full column definition as it appears in CREATE TABLE
    pub fn definition(&self) -> String {
        let constraints = self.constraint_fragment();
        if constraints.is_empty() {
            format!("{} {}", self.name, self.ty.sql())
        } else {
            format!("{} {} {}", self.name, self.ty.sql(), constraints)
        }
    }

    /// Check a candidate value, returning every violation found
    pub fn verify(&self, value: &Value) -> Vec<String> {
        let mut violations = Vec::new();

        if value.is_null() {
            if self.required && !self.auto_increment {
                violations.push(format!("{} is required", self.name));
            }
            return violations;
        }

        if !self.ty.accepts(value) {
            violations.push(format!("{} must be {}", self.name, self.ty.describe()));
            return violations;
        }

        if let (Some(max), Some(text)) = (self.max_len, value.as_str())
            && text.chars().count() > max
        {
            violations.push(format!("{} must be at most {} characters", self.name, max));
        }

        violations
    }
}

/// A table declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn create_sql(&self) -> String {
        let defs: Vec<String> = self.columns.iter().map(Column::definition).collect();
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, defs.join(", "))
    }

    /// Validate a row keyed by column name
    ///
    /// Missing keys are checked as null; keys naming no declared column are
    /// reported as violations.
    pub fn verify_row(&self, row: &Map<String, Value>) -> Vec<String> {
        let mut violations: Vec<String> = self
            .columns
            .iter()
            .flat_map(|c| c.verify(row.get(c.name()).unwrap_or(&Value::Null)))
            .collect();

        for key in row.keys() {
            if !self.columns.iter().any(|c| c.name() == key) {
                violations.push(format!("unknown column {}", key));
            }
        }

        violations
    }
}
