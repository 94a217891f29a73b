//! Rendering of demo run results.

use std::time::Duration;

use anyhow::Result;
use console::style;
use conveyor_observe::attrs;
use conveyor_types::workflow::RunState;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Outcome of one demo run.
#[derive(Debug)]
pub struct RunReport {
    pub workflow: String,
    pub run_id: Option<Uuid>,
    pub state: RunState,
    pub steps: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub context: Value,
}

impl RunReport {
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(attrs::WORKFLOW_NAME.to_string(), Value::from(self.workflow.clone()));
        map.insert(
            attrs::RUN_ID.to_string(),
            self.run_id.map(|id| Value::from(id.to_string())).unwrap_or(Value::Null),
        );
        map.insert(attrs::RUN_STATE.to_string(), Value::from(self.state.to_string()));
        map.insert(attrs::STEP_COUNT.to_string(), Value::from(self.steps));
        map.insert(
            attrs::RUN_DURATION_MS.to_string(),
            Value::from(self.elapsed.as_millis() as u64),
        );
        map.insert(
            attrs::ERROR_MESSAGE.to_string(),
            self.error.clone().map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(attrs::CONTEXT.to_string(), self.context.clone());
        Value::Object(map)
    }
}

pub fn print(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        return Ok(());
    }

    let state = match report.state {
        RunState::Completed => style(report.state.to_string()).green(),
        RunState::ErrorHandled => style(report.state.to_string()).yellow(),
        _ => style(report.state.to_string()).red(),
    };

    println!();
    println!("  {} {}", style("⚡").bold(), style(&report.workflow).cyan().bold());
    println!();
    println!("  {}", style("── Run ──").dim());
    if let Some(run_id) = report.run_id {
        println!("  Run:      {}", style(run_id).dim());
    }
    println!("  State:    {state}");
    println!("  Steps:    {}", style(report.steps).bold());
    println!("  Elapsed:  {}ms", report.elapsed.as_millis());
    if let Some(error) = &report.error {
        println!("  Error:    {}", style(error).red());
    }
    println!();
    println!("  {}", style("── Context ──").dim());
    let values = report.context.get("values").cloned().unwrap_or(Value::Null);
    for line in serde_json::to_string_pretty(&values)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
