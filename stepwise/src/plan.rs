//! Plan file loading with schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::{PlanResponse, StepSpec};

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");

/// Load a plan from a JSON file.
///
/// Accepts a bare array of steps or an `{explanation, plan}` object. Every
/// schema violation is reported together.
pub fn load_plan(path: &Path) -> Result<PlanResponse> {
    let raw = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&raw).with_context(|| format!("load plan {}", path.display()))
}

pub fn parse_plan(raw: &str) -> Result<PlanResponse> {
    let value: Value = serde_json::from_str(raw).context("parse plan json")?;
    validate_schema(&value)?;
    match value {
        Value::Array(_) => {
            let plan: Vec<StepSpec> =
                serde_json::from_value(value).context("deserialize plan steps")?;
            Ok(PlanResponse {
                explanation: None,
                plan,
            })
        }
        other => serde_json::from_value(other).context("deserialize plan"),
    }
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("plan schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
