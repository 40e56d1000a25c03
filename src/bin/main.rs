use clap::Parser;
use kiwi::Kiwi;

fn main() -> anyhow::Result<()> {
    let cli = Kiwi::parse();
    cli.exec()?;
    Ok(())
}
