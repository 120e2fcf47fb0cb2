use anyhow::Result;

fn main() -> Result<()> {
    agent_market::run()?;
    Ok(())
}
