//! Presenting command results to the user.

use std::{error, fmt};
use std::str::FromStr;

use serde::Serialize;

use crate::hsm::KeyInfo;


//------------ ReportFormat --------------------------------------------------

/// The format to present results in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    None,
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, ReportError> {
        match s {
            "none" => Ok(ReportFormat::None),
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnrecognisedFormat(s.to_string())),
        }
    }
}


//------------ ReportError ---------------------------------------------------

#[derive(Clone, Debug)]
pub enum ReportError {
    UnrecognisedFormat(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognisedFormat(s) => write!(f, "This report format is not recognised: {}", s),
        }
    }
}

impl error::Error for ReportError {}


//------------ Reportable ----------------------------------------------------

/// A command result that can be shown to the user.
pub trait Reportable: Serialize {
    fn text(&self) -> String;

    /// Whether the result describes a success.
    fn success(&self) -> bool {
        true
    }
}


//------------ Report --------------------------------------------------------

/// The rendered outcome of a command.
pub struct Report {
    content: Result<Content, String>,
}

struct Content {
    text: String,
    json: Result<String, String>,
    success: bool,
}

impl Report {
    pub fn from_error(err: impl fmt::Display) -> Self {
        Report {
            content: Err(err.to_string()),
        }
    }

    /// Prints the report and returns the exit status for the process.
    pub fn report(self, format: ReportFormat) -> i32 {
        match self.content {
            Ok(content) => {
                match format {
                    ReportFormat::None => {}
                    ReportFormat::Text => print!("{}", content.text),
                    ReportFormat::Json => match content.json {
                        Ok(json) => println!("{}", json),
                        Err(err) => {
                            eprintln!("Error: {}", err);
                            return 1;
                        }
                    },
                }
                if content.success { 0 } else { 1 }
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                1
            }
        }
    }

    /// Returns the text rendering, or the error message.
    pub fn text(&self) -> Result<&str, &str> {
        match &self.content {
            Ok(content) => Ok(&content.text),
            Err(err) => Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(&self.content, Ok(content) if content.success)
    }
}

impl<T: Reportable, E: fmt::Display> From<Result<T, E>> for Report {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(value) => Report {
                content: Ok(Content {
                    text: value.text(),
                    json: serde_json::to_string_pretty(&value).map_err(|err| err.to_string()),
                    success: value.success(),
                }),
            },
            Err(err) => Report::from_error(err),
        }
    }
}


//------------ Reportable Results --------------------------------------------

impl Reportable for KeyInfo {
    fn text(&self) -> String {
        format!(
            "{} {} {}/{}\n",
            self.repository, self.locator, self.algorithm_name, self.bits
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct KeyList {
    pub keys: Vec<KeyInfo>,
}

impl Reportable for KeyList {
    fn text(&self) -> String {
        let mut res = String::new();
        for key in &self.keys {
            res.push_str(&key.text());
        }
        res.push_str(&format!("{} keys found.\n", self.keys.len()));
        res
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Removed {
    pub locator: String,
}

impl Reportable for Removed {
    fn text(&self) -> String {
        format!("Key {} removed.\n", self.locator)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DnskeyReport {
    pub record: String,
    pub key_tag: u16,
}

impl Reportable for DnskeyReport {
    fn text(&self) -> String {
        format!("{} ; key tag {}\n", self.record, self.key_tag)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RandomBytes {
    pub hex: String,
}

impl Reportable for RandomBytes {
    fn text(&self) -> String {
        format!("{}\n", self.hex)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub token_label: String,
    pub provider: String,
    pub keys: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct InfoReport {
    pub version: String,
    pub repositories: Vec<RepositoryInfo>,
    pub check: String,
}

impl Reportable for InfoReport {
    fn text(&self) -> String {
        let mut res = format!("Version: {}\n", self.version);
        for repository in &self.repositories {
            res.push_str(&format!(
                "Repository: {}\n  Token label: {}\n  Provider: {}\n  Keys: {}\n",
                repository.name, repository.token_label, repository.provider, repository.keys
            ));
        }
        res.push_str(&format!("Check: {}\n", self.check));
        res
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "message")]
pub enum TestOutcome {
    Passed,
    Skipped(String),
    Failed(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct TestResult {
    pub key: String,
    pub algorithm: String,
    pub outcome: TestOutcome,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestReport {
    pub repository: String,
    pub results: Vec<TestResult>,
}

impl Reportable for TestReport {
    fn text(&self) -> String {
        let mut res = format!("Testing repository '{}'\n", self.repository);
        for result in &self.results {
            let outcome = match &result.outcome {
                TestOutcome::Passed => "passed".to_string(),
                TestOutcome::Skipped(msg) => format!("skipped ({})", msg),
                TestOutcome::Failed(msg) => format!("FAILED ({})", msg),
            };
            res.push_str(&format!("  {} with {}: {}\n", result.key, result.algorithm, outcome));
        }
        res
    }

    fn success(&self) -> bool {
        self.results
            .iter()
            .all(|result| !matches!(result.outcome, TestOutcome::Failed(_)))
    }
}


//------------ Tests ---------------------------------------------------------
