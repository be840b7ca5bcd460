//! The `config` command: inspect and initialize configuration files.

use crate::cli::{ConfigAction, ConfigArgs};
use crate::config::{ConfigService, ProductionConfigService};
use crate::error::WhisperdError;
use crate::Result;

/// Execute a configuration action.
pub async fn execute(args: ConfigArgs) -> Result<()> {
    let service = match args.config {
        Some(path) => ProductionConfigService::with_config_file(path)?,
        None => ProductionConfigService::new()?,
    };

    match args.action {
        ConfigAction::Show => {
            let config = service.get_config()?;
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| WhisperdError::config(format!("TOML serialization failed: {}", e)))?;
            println!("{}", rendered);
        }
        ConfigAction::Path => {
            println!("{}", service.get_config_file_path()?.display());
        }
        ConfigAction::Init => {
            let path = service.get_config_file_path()?;
            service.save_config_to_file(&path)?;
            println!("configuration written to {}", path.display());
        }
    }
    Ok(())
}
