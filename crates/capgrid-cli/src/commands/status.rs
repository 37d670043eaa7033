use serde_json::Value;

use super::{print_json, str_of};
use crate::client::ApiClient;

pub async fn status(client: &ApiClient, json: bool) -> anyhow::Result<()> {
    let report = client.get("/api/v1/status").await?;
    if json {
        return print_json(&report);
    }

    let empty = Vec::new();
    println!("Pools:");
    for pool in report["pools"].as_array().unwrap_or(&empty) {
        let counts = pool["nodes"]
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(state, n)| format!("{state}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        println!(
            "  {:<16} min={:<3} max={:<3} {}",
            str_of(pool, "name"),
            pool["min_size"],
            pool["max_size"],
            counts
        );
    }

    let nodes = report["nodes"].as_array().unwrap_or(&empty);
    println!("Nodes ({}):", nodes.len());
    for node in nodes {
        println!(
            "  {:<24} {:<12} {:<16} {:<10} workloads={}",
            str_of(node, "id"),
            str_of(node, "state"),
            str_of(node, "pool"),
            str_of(node, "shape"),
            node["workloads"].as_array().map_or(0, Vec::len),
        );
    }

    println!("Pending workloads: {}", report["pending_workloads"]);
    let draining = report["draining"].as_array().unwrap_or(&empty);
    if !draining.is_empty() {
        let ids: Vec<&str> = draining.iter().filter_map(Value::as_str).collect();
        println!("Draining: {}", ids.join(", "));
    }
    let policy = &report["policy"];
    println!(
        "Policy: {} shapes, {} pools, {} traffic policies, {} gateway rules",
        policy["shapes"], policy["pools"], policy["traffic_policies"], policy["gateway_rules"]
    );
    Ok(())
}
