use tabpilot_core::{Config, Paths};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let config_path = paths.config_file();
    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }

    let config = Config::default();
    config.save(&config_path)?;

    println!("Initialized {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Point bridge.url at your policy server (default {})", config.bridge.url);
    println!(
        "  2. Start Chrome with --remote-debugging-port={} or set chrome.launchIfMissing",
        config.chrome.debug_port
    );
    println!("  3. tabpilot run --goal \"...\"");
    Ok(())
}
