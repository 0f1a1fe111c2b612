use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::validation::{ColumnType, ExpectationSuite, Rule};
use crate::weather::{Cell, Table};

const SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub unexpected_count: usize,
    /// Zero-based row positions of the first offending rows.
    pub sample_rows: Vec<usize>,
    pub sample_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: Rule,
    pub success: bool,
    pub failure: Option<FailureDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub suite_name: String,
    pub suite_version: u32,
    pub evaluated_rows: usize,
    pub success: bool,
    pub results: Vec<RuleOutcome>,
}

impl ValidationResult {
    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Evaluates every rule of `suite` against `table`. The result is a pure
/// function of its inputs.
pub fn validate(table: &Table, suite: &ExpectationSuite) -> ValidationResult {
    let results: Vec<RuleOutcome> = suite
        .rules
        .iter()
        .map(|rule| {
            let failure = check(table, rule);
            RuleOutcome {
                rule: rule.clone(),
                success: failure.is_none(),
                failure,
            }
        })
        .collect();

    ValidationResult {
        suite_name: suite.name.clone(),
        suite_version: suite.version,
        evaluated_rows: table.len(),
        success: results.iter().all(|r| r.success),
        results,
    }
}

fn check(table: &Table, rule: &Rule) -> Option<FailureDetail> {
    match rule {
        Rule::ColumnSet {
            columns,
            exact_match,
        } => check_column_set(table, columns, *exact_match),
        Rule::ColumnType {
            column,
            column_type,
        } => row_check(table, column, "values of the wrong type", |cell| {
            cell.is_null() || conforms(cell, *column_type)
        }),
        Rule::Range { column, min, max } => {
            row_check(table, column, &format!("values outside [{}, {}]", min, max), |cell| {
                match cell {
                    Cell::Null => true,
                    Cell::Number(n) => *n >= *min && *n <= *max,
                    _ => false,
                }
            })
        }
        Rule::NotNull { column } => row_check(table, column, "null values", |cell| !cell.is_null()),
        Rule::Unique { column } => check_unique(table, column),
        Rule::ZeroImpliesZero { condition, target } => check_zero_implies_zero(table, condition, target),
    }
}

fn conforms(cell: &Cell, column_type: ColumnType) -> bool {
    matches!(
        (cell, column_type),
        (Cell::Date(_), ColumnType::Date)
            | (Cell::Number(_), ColumnType::Float)
            | (Cell::Text(_), ColumnType::Text)
    )
}

fn missing_column(column: &str) -> FailureDetail {
    FailureDetail {
        message: format!("column {} is missing", column),
        unexpected_count: 0,
        sample_rows: Vec::new(),
        sample_values: Vec::new(),
    }
}

/// Collects the rows whose cell fails `ok` into a failure detail.
fn row_check<F>(table: &Table, column: &str, what: &str, ok: F) -> Option<FailureDetail>
where
    F: Fn(&Cell) -> bool,
{
    let Some(cells) = table.column(column) else {
        return Some(missing_column(column));
    };
    let offending: Vec<(usize, String)> = cells
        .enumerate()
        .filter(|(_, cell)| !ok(*cell))
        .map(|(row, cell)| (row, cell.to_string()))
        .collect();
    detail(column, what, offending)
}

fn detail(column: &str, what: &str, offending: Vec<(usize, String)>) -> Option<FailureDetail> {
    if offending.is_empty() {
        return None;
    }
    Some(FailureDetail {
        message: format!("{} has {} {}", column, offending.len(), what),
        unexpected_count: offending.len(),
        sample_rows: offending.iter().take(SAMPLE_SIZE).map(|(row, _)| *row).collect(),
        sample_values: offending.into_iter().take(SAMPLE_SIZE).map(|(_, v)| v).collect(),
    })
}

fn check_column_set(table: &Table, expected: &[String], exact_match: bool) -> Option<FailureDetail> {
    let missing: Vec<String> = expected
        .iter()
        .filter(|c| !table.columns.contains(*c))
        .cloned()
        .collect();
    let unexpected: Vec<String> = if exact_match {
        table
            .columns
            .iter()
            .filter(|c| !expected.contains(*c))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    if missing.is_empty() && unexpected.is_empty() {
        return None;
    }
    let mut message = Vec::new();
    if !missing.is_empty() {
        message.push(format!("missing [{}]", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        message.push(format!("unexpected [{}]", unexpected.join(", ")));
    }
    Some(FailureDetail {
        message: message.join("; "),
        unexpected_count: missing.len() + unexpected.len(),
        sample_rows: Vec::new(),
        sample_values: missing.into_iter().chain(unexpected).take(SAMPLE_SIZE).collect(),
    })
}

/// Every row holding a value seen elsewhere in the column counts, the first
/// occurrence included. Nulls are left to the not-null rule.
fn check_unique(table: &Table, column: &str) -> Option<FailureDetail> {
    let Some(cells) = table.column(column) else {
        return Some(missing_column(column));
    };
    let cells: Vec<(usize, String)> = cells
        .enumerate()
        .filter(|(_, cell)| !cell.is_null())
        .map(|(row, cell)| (row, cell.to_string()))
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, value) in &cells {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    let offending: Vec<(usize, String)> = cells
        .iter()
        .filter(|(_, value)| counts[value.as_str()] > 1)
        .cloned()
        .collect();
    detail(column, "duplicated values", offending)
}

fn check_zero_implies_zero(table: &Table, condition: &str, target: &str) -> Option<FailureDetail> {
    let (Some(ci), Some(ti)) = (table.column_index(condition), table.column_index(target)) else {
        let absent = if table.column_index(condition).is_none() {
            condition
        } else {
            target
        };
        return Some(missing_column(absent));
    };

    let offending: Vec<(usize, String)> = table
        .rows
        .iter()
        .enumerate()
        .filter_map(|(row, cells)| {
            let cond = cells.get(ci).and_then(Cell::as_number)?;
            let value = cells.get(ti).and_then(Cell::as_number)?;
            (cond == 0.0 && value != 0.0).then(|| (row, format!("{}={}, {}={}", condition, cond, target, value)))
        })
        .collect();
    detail(
        target,
        &format!("non-zero values where {} is zero", condition),
        offending,
    )
}
