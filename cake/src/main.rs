use cake::{cli, logging};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init(None);

    let cli = cli::Cli::parse();
    cli::dispatch(cli)
}
