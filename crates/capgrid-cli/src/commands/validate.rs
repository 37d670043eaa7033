use std::path::Path;

use capgrid_config::PolicyDocument;

/// Parse and compile a policy document offline.
pub fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    match PolicyDocument::load(path) {
        Ok(policy) => {
            if json {
                let summary = serde_json::json!({
                    "valid": true,
                    "shapes": policy.catalog.len(),
                    "pools": policy.pools.len(),
                    "traffic_policies": policy.traffic.len(),
                    "gateway_rules": policy.gateway.len(),
                });
                super::print_json(&summary)?;
            } else {
                println!(
                    "✓ {} is valid: {} shapes, {} pools, {} traffic policies, {} gateway rules",
                    path.display(),
                    policy.catalog.len(),
                    policy.pools.len(),
                    policy.traffic.len(),
                    policy.gateway.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            for message in e.messages() {
                eprintln!("  ✗ {message}");
            }
            Err(e.into())
        }
    }
}
