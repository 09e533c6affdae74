use super::{config_error, json_pretty, load_layers, template_context, EXIT_SUCCESS};
use kiln_core::Builder;
use std::path::PathBuf;

pub fn run(configs: &[PathBuf], vars: &[String], json: bool) -> Result<u8, String> {
    let ctx = template_context(vars)?;
    let layers = load_layers(configs)?;
    let mut builder = Builder::new().with_context(ctx);
    let warnings = builder.prepare(&layers).map_err(|e| config_error(&e))?;

    if json {
        let image_name = builder.config().map(|c| c.image_name.clone());
        let payload = serde_json::json!({
            "valid": true,
            "image_name": image_name,
            "warnings": warnings,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for warning in &warnings {
            eprintln!("warning: {warning}");
        }
        println!("configuration is valid");
    }
    Ok(EXIT_SUCCESS)
}
