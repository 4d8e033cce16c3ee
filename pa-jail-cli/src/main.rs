use clap::Parser;
use pa_jail_cli::{runner, Cli};
use std::process;

fn main() {
    let _logger = flexi_logger::Logger::try_with_env_or_str("warn")
        .and_then(|logger| logger.log_to_stderr().start());

    let cli = Cli::parse();
    let code = match runner::run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    };
    process::exit(code);
}
