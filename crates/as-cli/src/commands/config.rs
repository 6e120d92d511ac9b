use std::path::Path;

use as_core::config::Config;

pub fn run(config: &Config, path: &Path, path_only: bool) -> anyhow::Result<()> {
    if path_only {
        println!("{}", path.display());
        return Ok(());
    }
    println!("# {}", path.display());
    print!("{}", config.to_toml()?);
    Ok(())
}
