// Result of one task run.

use serde::Serialize;
use serde_json::Value;

use aidevs_core::flag::scan_flag;
use aidevs_core::http::ReportOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Task name as sent to the grading server.
    pub task: String,
    pub answer: Value,
    /// Raw body of the grading server's reply, when something was submitted.
    pub response: Option<String>,
    pub flag: Option<String>,
    pub success: bool,
}

impl TaskOutcome {
    pub fn from_report(task: &str, answer: Value, report: &ReportOutcome) -> Self {
        Self {
            task: task.to_string(),
            answer,
            response: Some(report.body.clone()),
            flag: report.flag.clone(),
            success: report.accepted(),
        }
    }

    /// A reply from a non-Centrala endpoint; success means it held a flag.
    pub fn from_text(task: &str, answer: Value, body: &str) -> Self {
        let flag = scan_flag(body);
        Self {
            task: task.to_string(),
            answer,
            response: Some(body.to_string()),
            success: flag.is_some(),
            flag,
        }
    }

    /// A result produced locally without submitting anything.
    pub fn local(task: &str, answer: Value) -> Self {
        Self {
            task: task.to_string(),
            answer,
            response: None,
            flag: None,
            success: true,
        }
    }

    /// A run that gave up before submitting.
    pub fn failed(task: &str, reason: impl Into<String>) -> Self {
        Self {
            task: task.to_string(),
            answer: Value::Null,
            response: Some(reason.into()),
            flag: None,
            success: false,
        }
    }

    pub fn with_flag(mut self, flag: Option<String>) -> Self {
        if self.flag.is_none() {
            self.flag = flag;
        }
        self
    }
}
