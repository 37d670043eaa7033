use std::time::Duration;

use super::{print_json, str_of};
use crate::client::ApiClient;

pub async fn drain(
    client: &ApiClient,
    node: &str,
    force: bool,
    grace: Option<Duration>,
    json: bool,
) -> anyhow::Result<()> {
    let mut path = format!("/api/v1/nodes/{node}/drain?force={force}");
    if let Some(grace) = grace {
        path.push_str(&format!("&grace_secs={}", grace.as_secs()));
    }
    let response = client.post(&path).await?;
    if json {
        return print_json(&response);
    }
    match str_of(&response, "outcome") {
        "started" => println!("✓ Draining {node}"),
        "already_draining" => println!("  {node} is already draining"),
        other => println!("  {node}: {other}"),
    }
    Ok(())
}
