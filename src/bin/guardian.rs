use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = guardian::gd::cli::Args::parse();
    guardian::gd::cli::run(args).await
}
