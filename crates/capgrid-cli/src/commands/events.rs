use super::print_json;
use crate::client::ApiClient;

pub async fn events(client: &ApiClient, since: u64, limit: usize, json: bool) -> anyhow::Result<()> {
    let path = format!("/api/v1/events?since={since}&limit={limit}");
    let events = client.get(&path).await?;
    if json {
        return print_json(&events);
    }
    for event in events.as_array().into_iter().flatten() {
        let kind = &event["kind"];
        let name = kind["type"].as_str().unwrap_or("event");
        let mut detail = kind.clone();
        if let Some(obj) = detail.as_object_mut() {
            obj.remove("type");
        }
        println!("{:>6} {:>10} {:<28} {}", event["seq"], event["at"], name, detail);
    }
    Ok(())
}
