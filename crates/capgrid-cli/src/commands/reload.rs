use super::print_json;
use crate::client::ApiClient;

pub async fn reload(client: &ApiClient, json: bool) -> anyhow::Result<()> {
    let summary = client.post("/api/v1/policy/reload").await?;
    if json {
        return print_json(&summary);
    }
    println!(
        "✓ Policy applied: {} shapes, {} pools, {} traffic policies, {} gateway rules",
        summary["shapes"], summary["pools"], summary["traffic_policies"], summary["gateway_rules"]
    );
    Ok(())
}
