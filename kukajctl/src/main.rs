use clap::Parser;

fn main() {
    let cli = kukajctl::Cli::parse();
    if let Err(err) = kukajctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
