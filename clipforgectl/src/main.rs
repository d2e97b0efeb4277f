use clap::Parser;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clipforgectl=info,job=info,transform=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = clipforgectl::Cli::parse();
    if let Err(err) = clipforgectl::run(cli) {
        eprintln!("error: {}", err.operator_message());
        std::process::exit(1);
    }
}
