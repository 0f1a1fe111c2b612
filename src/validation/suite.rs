use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::info;
use crate::PipelineError;
use crate::weather::{self, all_columns};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Date,
    Float,
    Text,
}

/// One declarative constraint on one column or a pair of columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// The table must contain these columns; with `exact_match` it must
    /// contain nothing else.
    ColumnSet {
        columns: Vec<String>,
        exact_match: bool,
    },
    ColumnType {
        column: String,
        column_type: ColumnType,
    },
    /// Inclusive on both ends. Nulls are not checked here.
    Range { column: String, min: f64, max: f64 },
    NotNull { column: String },
    Unique { column: String },
    /// Wherever `condition` is zero, `target` must be zero as well.
    ZeroImpliesZero { condition: String, target: String },
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::ColumnSet { exact_match, .. } => {
                write!(f, "columns {}", if *exact_match { "match set" } else { "include set" })
            }
            Rule::ColumnType { column, column_type } => {
                write!(f, "{} is of type {:?}", column, column_type)
            }
            Rule::Range { column, min, max } => write!(f, "{} in [{}, {}]", column, min, max),
            Rule::NotNull { column } => write!(f, "{} not null", column),
            Rule::Unique { column } => write!(f, "{} unique", column),
            Rule::ZeroImpliesZero { condition, target } => {
                write!(f, "{} == 0 implies {} == 0", condition, target)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectationSuite {
    pub name: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub rules: Vec<Rule>,
}

/// The rule set applied to freshly fetched weather data.
pub fn default_suite(name: &str) -> ExpectationSuite {
    let mut rules = vec![Rule::ColumnSet {
        columns: all_columns(),
        exact_match: false,
    }];

    rules.push(Rule::ColumnType {
        column: weather::DATE.to_string(),
        column_type: ColumnType::Date,
    });
    for column in weather::NUMERIC_COLUMNS {
        rules.push(Rule::ColumnType {
            column: column.to_string(),
            column_type: ColumnType::Float,
        });
    }

    let ranges: [(&str, f64, f64); 11] = [
        (weather::TEMPERATURE_MAX, -5.0, 50.0),
        (weather::TEMPERATURE_MIN, -5.0, 50.0),
        (weather::HUMIDITY_MAX, 0.0, 100.0),
        (weather::HUMIDITY_MIN, 0.0, 100.0),
        (weather::WIND_SPEED_MAX, 0.0, 30.0),
        (weather::WIND_SPEED_MIN, 0.0, 30.0),
        (weather::HUMIDITY_MEAN, 0.0, 100.0),
        (weather::CLOUD_COVER_MEAN, 0.0, 100.0),
        (weather::SURFACE_PRESSURE_MEAN, 970.0, 1050.0),
        (weather::PRECIPITATION_HOURS, 0.0, 24.0),
        (weather::RAIN_SUM, 0.0, 150.0),
    ];
    for (column, min, max) in ranges {
        rules.push(Rule::Range {
            column: column.to_string(),
            min,
            max,
        });
    }

    rules.push(Rule::NotNull {
        column: weather::DATE.to_string(),
    });
    rules.push(Rule::Unique {
        column: weather::DATE.to_string(),
    });
    rules.push(Rule::ZeroImpliesZero {
        condition: weather::PRECIPITATION_HOURS.to_string(),
        target: weather::RAIN_SUM.to_string(),
    });

    ExpectationSuite {
        name: name.to_string(),
        version: 1,
        created_at: Utc::now(),
        rules,
    }
}

/// Suites persisted as `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct SuiteStore {
    dir: PathBuf,
}

impl SuiteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    pub fn get(&self, name: &str) -> Result<ExpectationSuite, PipelineError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(PipelineError::Configuration(format!(
                "expectation suite {} not found in {}",
                name,
                self.dir.display()
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns the stored suite untouched, or creates and persists the
    /// default one.
    pub fn ensure_suite(&self, name: &str) -> Result<ExpectationSuite, PipelineError> {
        if self.exists(name) {
            return self.get(name);
        }
        let suite = default_suite(name);
        self.write(&suite)?;
        info!(suite = name, rules = suite.rules.len(), "expectation suite created");
        Ok(suite)
    }

    /// Replaces the rules of an existing suite and bumps its version.
    pub fn update_suite(&self, name: &str, rules: Vec<Rule>) -> Result<ExpectationSuite, PipelineError> {
        let mut suite = self.get(name)?;
        suite.version += 1;
        suite.rules = rules;
        self.write(&suite)?;
        info!(suite = name, version = suite.version, "expectation suite updated");
        Ok(suite)
    }

    fn write(&self, suite: &ExpectationSuite) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&suite.name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(suite)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
