//! Network command - create and delete managed network environments

use crate::audit::AuditLog;
use crate::cli::args::{NetworkAction, NetworkArgs};
use crate::config::Config;
use crate::error::ForgeResult;
use crate::network::{NetworkEnvironment, NetworkProvisioner};
use crate::provider::create_providers;
use crate::ui::{self, TaskSpinner, UiContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Execute the network command
pub async fn execute(args: NetworkArgs, config: &Config) -> ForgeResult<()> {
    match args.action {
        NetworkAction::Create {
            name,
            region,
            output,
        } => {
            let region = region.unwrap_or_else(|| config.aws.region.clone());
            let output = output.unwrap_or_else(|| default_output(&name));
            create(config, &name, &region, &output).await
        }
        NetworkAction::Delete { file, yes } => delete(config, &file, yes).await,
    }
}

fn provisioner(config: &Config, region: &str) -> ForgeResult<NetworkProvisioner> {
    let providers = create_providers(config)?;
    Ok(NetworkProvisioner::new(
        providers.network,
        region,
        config.network.clone(),
        Arc::new(AuditLog::new(config)),
    )
    .with_cancel(super::cancel_on_ctrl_c()))
}

async fn create(config: &Config, name: &str, region: &str, output: &Path) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let provisioner = provisioner(config, region)?;

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Creating network '{}' in {}...", name, region));
    let env = match provisioner.create_network(name).await {
        Ok(env) => env,
        Err(e) => {
            spinner.stop_error("Network creation failed; created resources were removed");
            return Err(e);
        }
    };
    spinner.stop(&format!("Network '{}' created", name));

    env.save(output).await?;

    ui::key_value(&ctx, "VPC", &env.vpc_id);
    ui::key_value(&ctx, "Gateway", &env.gateway_id);
    ui::key_value(&ctx, "Public subnet", &env.public_subnet_id);
    ui::key_value(&ctx, "Private subnet", &env.private_subnet_id);
    ui::key_value(&ctx, "Route table", &env.route_table_id);
    ui::key_value(&ctx, "Security group", &env.security_group_id);
    ui::step_ok_detail(&ctx, "Environment saved", &output.display().to_string());

    Ok(())
}

async fn delete(config: &Config, file: &Path, yes: bool) -> ForgeResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let env = NetworkEnvironment::load(file).await?;

    if !env.managed {
        ui::step_warn_hint(
            &ctx,
            &format!("Network '{}' was not created by envforge", env.name),
            "Nothing deleted",
        );
        return Ok(());
    }

    let prompt = format!(
        "Delete network '{}' ({}) in {}?",
        env.name, env.vpc_id, env.region
    );
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::step_info(&ctx, "Cancelled (use --yes to skip the prompt)");
        return Ok(());
    }

    let provisioner = provisioner(config, &env.region)?;
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Deleting network '{}'...", env.name));
    if let Err(e) = provisioner.delete_network(&env).await {
        spinner.stop_error("Some resources could not be deleted");
        return Err(e);
    }
    spinner.stop(&format!("Network '{}' deleted", env.name));

    Ok(())
}

fn default_output(name: &str) -> PathBuf {
    PathBuf::from(format!("{}.network.json", name))
}
