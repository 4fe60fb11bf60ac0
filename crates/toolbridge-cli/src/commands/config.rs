//! Configuration management commands.

use toolbridge_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config, json: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("{}", toml::to_string_pretty(config)?);
            }
        }
        ConfigAction::Path => {
            println!("User config:    {}", Config::config_dir().join("config.toml").display());
            println!("Project config: {}", Config::project_config_path().display());
            println!("Local config:   .toolbridge/config.local.toml");
            println!("Environment:    TOOLBRIDGE_*");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolbridge_core::ServerConfig;

    #[test]
    fn test_config_renders_as_toml() {
        let mut config = Config::default();
        config.servers.push(ServerConfig::stdio("fs", "npx").with_args(vec!["-y".to_string()]));

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[[servers]]"));
        assert!(rendered.contains("type = \"stdio\""));
    }
}
