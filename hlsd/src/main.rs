use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = hlsd::Cli::parse();
    hlsd::init_tracing(cli.debug);
    if let Err(err) = hlsd::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
