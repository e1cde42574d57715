use clap::Parser;

fn main() {
    let cli = qwatchctl::Cli::parse();
    qwatchctl::init_tracing(&cli.log_level);
    if let Err(err) = qwatchctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
