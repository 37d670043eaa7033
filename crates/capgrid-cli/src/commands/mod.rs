pub mod drain;
pub mod events;
pub mod reconcile;
pub mod reload;
pub mod status;
pub mod validate;

use serde_json::Value;

pub(crate) fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn str_of<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}
