use clap::Parser;
use log::error;
use poolkeeper::config::{Cli, Config};
use poolkeeper::supervisor::{Supervisor, SupervisorOptions};

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let opts = SupervisorOptions {
        discard_status: cli.discard_status,
        clear_oidmaps: cli.clear_oidmaps,
    };

    if let Err(e) = Supervisor::run(cfg, cli.config, opts) {
        error!("supervisor failed: {:#}", e);
        std::process::exit(1);
    }
}
