//! Image commands - inspect and prune the image cache index

use crate::cache::ImageCacheEntry;
use crate::cli::args::{ImagesArgs, ImagesEvictArgs, ImagesRemoveArgs, OutputFormat};
use crate::config::Config;
use crate::error::ForgeResult;
use crate::provider::create_providers;
use crate::ui::{self, UiContext};
use chrono::{Duration, Utc};

/// Execute the images command
pub async fn list(args: ImagesArgs, config: &Config) -> ForgeResult<()> {
    let cache = super::image_cache(&create_providers(config)?);
    let entries = cache.list(args.region.as_deref()).await?;

    if entries.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => println!("No cached images found."),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}\t{}\t{}", entry.region, entry.hash, entry.image_id);
            }
        }
    }

    Ok(())
}

/// Execute the images-evict command
pub async fn evict(args: ImagesEvictArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let days = args.days.unwrap_or(config.retention.cache_max_age_days);
    let max_age = Duration::days(i64::from(days));
    let cache = super::image_cache(&create_providers(config)?);

    let now = Utc::now();
    let stale: Vec<_> = cache
        .list(None)
        .await?
        .into_iter()
        .filter(|e| e.unused_for(max_age, now))
        .collect();

    if stale.is_empty() {
        ui::step_info(&ctx, &format!("No entries unused for {} days", days));
        return Ok(());
    }

    println!("Unused for more than {} days:", days);
    for entry in &stale {
        println!(
            "  {} {} {} (last used {})",
            entry.region,
            entry.short_hash(),
            entry.image_id,
            entry.last_used.format("%Y-%m-%d")
        );
    }

    if args.dry_run {
        ui::remark(&ctx, "Dry run - nothing removed");
        return Ok(());
    }

    if !ui::confirm(&ctx, "Evict these entries? Images are not deleted.", true).await? {
        ui::step_info(&ctx, "Cancelled");
        return Ok(());
    }

    let evicted = cache.evict_older_than(max_age).await?;
    ui::step_ok(&ctx, &format!("Evicted {} cache entr(ies)", evicted.len()));
    Ok(())
}

/// Execute the images-remove command
pub async fn remove(args: ImagesRemoveArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let cache = super::image_cache(&create_providers(config)?);
    cache.remove_existing(&args.region, &args.hash).await?;
    ui::step_ok(
        &ctx,
        &format!("Removed cache entry {} in {}", args.hash, args.region),
    );
    Ok(())
}

fn print_table(entries: &[ImageCacheEntry]) {
    println!(
        "{:<14} {:<10} {:<24} {:<20} {:<17}",
        "REGION", "HASH", "IMAGE", "TEMPLATE", "LAST USED"
    );
    println!("{}", "-".repeat(89));

    for entry in entries {
        println!(
            "{:<14} {:<10} {:<24} {:<20} {:<17}",
            entry.region,
            entry.short_hash(),
            entry.image_id,
            entry.template,
            entry.last_used.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} image(s)", entries.len());
}
