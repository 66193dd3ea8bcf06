use sponge_core::EnvironmentParams;

use super::Context;

pub fn init(ctx: &Context, environment: &str, region: &str, force: bool) -> anyhow::Result<()> {
    if ctx.config.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            ctx.config.display()
        );
    }

    let params = EnvironmentParams::scaffold(environment, region);
    // Refuse to write something that would not validate.
    sponge_core::compose(&params)?;
    std::fs::write(&ctx.config, params.to_toml_string()?)?;
    println!("✓ Generated {}", ctx.config.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            state: dir.path().join("state.redb"),
            config: dir.path().join("sponge.toml"),
        };

        init(&ctx, "staging", "eu-west-1", false).unwrap();
        let composition = ctx.composition().unwrap();
        assert_eq!(composition.environment, "staging");
        assert_eq!(composition.region, "eu-west-1");

        assert!(init(&ctx, "staging", "eu-west-1", false).is_err());
        assert!(init(&ctx, "staging", "eu-west-1", true).is_ok());
    }
}
