use crate::cli::CliContext;
use crate::core::{config, control_plane};
use anyhow::Result;
use clap::Args;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing deploy.toml with the loaded settings
    #[arg(long)]
    pub force: bool,
}

pub fn run(ctx: &CliContext, args: InitArgs) -> Result<()> {
    let paths = &ctx.paths;
    control_plane::ensure_layout(paths)?;

    if args.force || !paths.config.exists() {
        config::save(&paths.config, &ctx.config)?;
        println!("wrote {}", paths.config.display());
    } else {
        println!("{} already exists (use --force to rewrite)", paths.config.display());
    }

    println!("control plane initialized at {}", paths.cloud.display());
    println!(
        "keypair function: {} (timeout {}s)",
        ctx.config.keypair.function_name, ctx.config.keypair.timeout_secs
    );
    Ok(())
}
