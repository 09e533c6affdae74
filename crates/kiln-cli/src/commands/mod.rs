pub mod build;
pub mod completions;
pub mod validate;

use kiln_config::{parse_layer_file, ConfigErrors, TemplateContext};
use std::path::PathBuf;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn config_error(errors: &ConfigErrors) -> String {
    format!("config error: {errors}")
}

/// Template context carrying every `--var NAME=VALUE`.
pub fn template_context(vars: &[String]) -> Result<TemplateContext, String> {
    let mut ctx = TemplateContext::new();
    for var in vars {
        let Some((name, value)) = var.split_once('=') else {
            return Err(format!(
                "config error: invalid --var '{var}', expected NAME=VALUE"
            ));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("config error: --var '{var}' has an empty name"));
        }
        ctx.set_var(name, value);
    }
    Ok(ctx)
}

/// Parse config files in order, so later files override earlier ones.
pub fn load_layers(configs: &[PathBuf]) -> Result<Vec<toml::Table>, String> {
    configs
        .iter()
        .map(|path| {
            parse_layer_file(path).map_err(|e| format!("config error: {}: {e}", path.display()))
        })
        .collect()
}
