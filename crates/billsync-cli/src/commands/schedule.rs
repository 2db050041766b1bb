//! Schedule command
//!
//! Starts the cron scheduler and keeps it running until Ctrl-C.

use anyhow::{Context as _, Result};
use billsync_core::SyncScheduler;

use super::Context;
use crate::output::{print_info, print_success, print_warning};

pub async fn execute(ctx: &Context) -> Result<()> {
    let (config, db) = ctx.connect().await?;
    let scheduler = SyncScheduler::new(db.engine(config));

    let scheduled = scheduler.start().await?;
    if scheduled == 0 {
        print_warning("No enabled schedule entries, nothing to run", ctx.quiet);
        scheduler.shutdown().await?;
        db.close().await;
        return Ok(());
    }
    print_success(
        &format!("Scheduler running with {} job(s), press Ctrl-C to stop", scheduled),
        ctx.quiet,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    print_info("Stopping scheduler...", ctx.quiet);
    scheduler.shutdown().await?;

    let running = scheduler.running();
    if !running.is_empty() {
        let names: Vec<String> = running.iter().map(|k| k.to_string()).collect();
        print_warning(
            &format!("Runs still in progress will be dropped: {}", names.join(", ")),
            ctx.quiet,
        );
    }
    db.close().await;
    Ok(())
}
