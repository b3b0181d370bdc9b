//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::ForgeResult;
use crate::ui::{self, UiContext};

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> ForgeResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> ForgeResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;

    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &path.display().to_string(),
    );
    ui::remark(&ctx, "Set build.base_image before running: envforge build");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn init_writes_defaults_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envforge").join("config.toml");
        let manager = ConfigManager::with_path(path.clone());

        init_config(&manager, false).await.unwrap();
        assert!(path.exists());

        std::fs::write(&path, "[build]\ninstance_type = \"m6i.large\"\n").unwrap();
        init_config(&manager, false).await.unwrap();
        let kept = manager.load().await.unwrap();
        assert_eq!(kept.build.instance_type, "m6i.large");

        init_config(&manager, true).await.unwrap();
        let reset = manager.load().await.unwrap();
        assert_eq!(reset.build.instance_type, "c5.xlarge");
    }
}
