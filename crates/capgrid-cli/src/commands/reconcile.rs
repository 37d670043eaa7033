use serde_json::Value;

use super::{print_json, str_of};
use crate::client::{ApiClient, CliError};

pub async fn reconcile(client: &ApiClient, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let path = format!("/api/v1/reconcile?dry_run={dry_run}");
    let report = client.post(&path).await?;
    if json {
        print_json(&report)?;
        return failures(&report).map_err(Into::into);
    }

    let empty = Vec::new();
    let actions = report["actions"].as_array().unwrap_or(&empty);
    if dry_run {
        println!("Planned actions (dry run): {}", actions.len());
    } else {
        println!("Actions: {}", actions.len());
    }
    for action in actions {
        match str_of(action, "action") {
            "scale_up" => println!(
                "  scale up   {} x{} {} (class {})",
                str_of(action, "pool"),
                action["count"],
                str_of(action, "shape"),
                action["class"].as_str().unwrap_or("min-size"),
            ),
            "shortfall" => println!(
                "  shortfall  class {} missing {} node(s): {}",
                str_of(action, "class"),
                action["missing_nodes"],
                str_of(action, "reason"),
            ),
            other => println!("  {other}"),
        }
    }

    let added = report["nodes_added"].as_array().unwrap_or(&empty);
    if !added.is_empty() {
        let ids: Vec<&str> = added.iter().filter_map(Value::as_str).collect();
        println!("✓ Added {}", ids.join(", "));
    }
    for failure in report["failures"].as_array().unwrap_or(&empty) {
        println!("✗ {}", failure.as_str().unwrap_or("provisioning failed"));
    }
    failures(&report).map_err(Into::into)
}

/// Provisioning that failed after its retries is an external failure.
fn failures(report: &Value) -> Result<(), CliError> {
    let failed: Vec<&str> = report["failures"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|f| f.as_str().unwrap_or("provisioning failed"))
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(CliError::External(format!(
        "{} provisioning action(s) failed: {}",
        failed.len(),
        failed.join("; ")
    )))
}
