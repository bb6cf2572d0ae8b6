//! Dataset queries and the interpreter expressions that answer them.
//!
//! Every query is answered by a single evaluation that loads the dataset,
//! subsets it and serializes the slice to JSON, so the full dataset never
//! crosses into the host:
//!
//! ```text
//! jsonlite::toJSON(haven::read_sas("/data/dm.sas7bdat")[1:2, TRUE], ...)
//! jsonlite::toJSON(dim(haven::read_xpt("/data/ae.xpt")))
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::foreign::ForeignValue;
use crate::interpreter::Interpreter;
use crate::runtime::QueryPhase;

/// Binary dataset formats understood by the interpreter's reader package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// SAS7BDAT, the legacy SAS dataset format
    Sas7bdat,
    /// SAS transport (XPORT) exchange format
    Xpt,
}

impl DatasetFormat {
    /// Pick the format from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("sas7bdat") => Ok(DatasetFormat::Sas7bdat),
            Some("xpt") => Ok(DatasetFormat::Xpt),
            _ => Err(BridgeError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Interpreter function that loads this format.
    pub fn reader(&self) -> &'static str {
        match self {
            DatasetFormat::Sas7bdat => "haven::read_sas",
            DatasetFormat::Xpt => "haven::read_xpt",
        }
    }
}

/// Row or column selector.
///
/// Expressions are passed through verbatim in the interpreter's own selection
/// syntax. They are not validated and are therefore an injection surface:
/// only accept selectors from trusted callers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    /// Every row / column
    #[default]
    All,
    /// Selection expression, e.g. `1:10` or `c("USUBJID", "AGE")`
    Expr(String),
}

impl Selector {
    /// Parse a caller-supplied selector. `all` (any case) and `TRUE` select
    /// everything; blank selectors are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BridgeError::InvalidQuery("empty selector".to_string()));
        }
        if s.eq_ignore_ascii_case("all") || s == "TRUE" {
            Ok(Selector::All)
        } else {
            Ok(Selector::Expr(s.to_string()))
        }
    }

    /// Selector as it appears inside the subsetting brackets.
    pub fn as_expr(&self) -> &str {
        match self {
            Selector::All => "TRUE",
            Selector::Expr(e) => e,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_expr())
    }
}

/// What to extract from a dataset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetQuery {
    path: PathBuf,
    format: DatasetFormat,
    rows: Selector,
    cols: Selector,
}

impl DatasetQuery {
    /// Query every row and column of the dataset at `path`.
    ///
    /// The path must be absolute and name a file with a known extension.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(BridgeError::InvalidQuery(format!(
                "dataset path must be absolute: {}",
                path.display()
            )));
        }
        if path.file_name().is_none() || path.parent().is_none() {
            return Err(BridgeError::InvalidQuery(format!(
                "dataset path has no file name: {}",
                path.display()
            )));
        }
        // The name is spliced into an interpreter expression verbatim.
        if path.file_name().and_then(|n| n.to_str()).is_none() {
            return Err(BridgeError::InvalidQuery(format!(
                "dataset file name is not valid UTF-8: {}",
                path.display()
            )));
        }
        let format = DatasetFormat::from_path(&path)?;
        Ok(Self {
            path,
            format,
            rows: Selector::All,
            cols: Selector::All,
        })
    }

    /// Builder: set row selector
    pub fn rows(mut self, rows: Selector) -> Self {
        self.rows = rows;
        self
    }

    /// Builder: set column selector
    pub fn cols(mut self, cols: Selector) -> Self {
        self.cols = cols;
        self
    }

    /// Dataset file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dataset format.
    pub fn format(&self) -> DatasetFormat {
        self.format
    }

    /// Row selector.
    pub fn row_selector(&self) -> &Selector {
        &self.rows
    }

    /// Column selector.
    pub fn col_selector(&self) -> &Selector {
        &self.cols
    }

    /// Directory that has to be mounted to reach the file.
    pub fn host_dir(&self) -> &Path {
        // Checked in `new`.
        self.path.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// File name inside the mounted directory.
    pub fn file_name(&self) -> &str {
        // Checked in `new`.
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Expression loading the selected slice and serializing it as an array of records.
    pub fn table_expr(&self, virtual_path: &str) -> String {
        format!(
            "jsonlite::toJSON({}({})[{}, {}], dataframe = \"rows\", na = \"null\", digits = NA)",
            self.format.reader(),
            string_literal(virtual_path),
            self.rows,
            self.cols
        )
    }

    /// Expression returning only the dataset dimensions as `[rows, cols]`.
    pub fn shape_expr(&self, virtual_path: &str) -> String {
        format!(
            "jsonlite::toJSON(dim({}({})))",
            self.format.reader(),
            string_literal(virtual_path)
        )
    }
}

/// Quote a string for the interpreter.
fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Evaluate the record extraction for `query` against the mounted file.
pub fn read_table<'a>(
    interpreter: &'a mut dyn Interpreter,
    query: &DatasetQuery,
    virtual_path: &str,
) -> Result<ForeignValue<'a>> {
    evaluate(interpreter, &query.table_expr(virtual_path))
}

/// Evaluate the dimension query for `query` against the mounted file.
pub fn read_shape<'a>(
    interpreter: &'a mut dyn Interpreter,
    query: &DatasetQuery,
    virtual_path: &str,
) -> Result<ForeignValue<'a>> {
    evaluate(interpreter, &query.shape_expr(virtual_path))
}

fn evaluate<'a>(interpreter: &'a mut dyn Interpreter, expr: &str) -> Result<ForeignValue<'a>> {
    tracing::debug!(expr, "phase: {}", QueryPhase::Evaluating);
    let id = interpreter
        .eval(expr)
        .map_err(|e| e.at(QueryPhase::Evaluating))?;
    Ok(ForeignValue::new(interpreter, id))
}
