use anyhow::Result;

use kube_kms_core::config::PluginConfig;

pub fn run(config: &PluginConfig) -> Result<()> {
    print!("{}", render(config)?);
    Ok(())
}

fn render(config: &PluginConfig) -> Result<String> {
    let hash = config.config_hash()?;
    let mut out = String::new();
    out.push_str(&format!("Key type:         {}\n", config.key.provider));
    out.push_str(&format!("Config hash:      {hash}\n"));
    out.push_str(&format!("KeyId prefix:     {hash}-v\n"));
    out.push_str(&format!("Default endpoint: {}\n", hash.default_endpoint()));
    if let Some(endpoint) = &config.plugin.endpoint {
        out.push_str(&format!("Endpoint:         {endpoint}\n"));
    }
    Ok(out)
}
