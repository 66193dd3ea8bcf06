use super::Context;

pub fn output(ctx: &Context, show_sensitive: bool) -> anyhow::Result<()> {
    let params = ctx.params()?;
    let store = ctx.store()?;
    match store.get_outputs(&params.environment)? {
        Some(outputs) => println!("{}", outputs.render(show_sensitive)),
        None => println!(
            "No outputs for '{}' yet. Run `sponge apply` first.",
            params.environment
        ),
    }
    Ok(())
}
