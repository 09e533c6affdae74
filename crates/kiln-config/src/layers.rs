use crate::ConfigError;
use std::fs;
use std::path::Path;
use toml::{Table, Value};

pub fn parse_layer_str(input: &str) -> Result<Table, ConfigError> {
    Ok(toml::from_str::<Table>(input)?)
}

pub fn parse_layer_file(path: impl AsRef<Path>) -> Result<Table, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_layer_str(&content)
}

/// Merge raw override layers in order. Later layers win; nested tables are
/// merged key by key, every other value is replaced wholesale.
pub fn merge_layers(layers: &[Table]) -> Table {
    let mut merged = Table::new();
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}

fn merge_into(base: &mut Table, overlay: &Table) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
