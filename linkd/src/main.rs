use clap::{App, Arg};
use linkd::manager::Config;
use linkd::server::Server;
use std::fs;
use strand::logging;

pub fn main() {
    let matches = App::new("PPP Controller")
        .version("1.0")
        .about("Supervises PPP connections over serial, PPPoE, PPTP and L2TP transports.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::with_name("socket")
                .long("socket")
                .takes_value(true)
                .help("Override the control socket path"),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    let mut config: Config =
        serde_json::from_reader(fs::File::open(config_path).expect("Error opening config file"))
            .expect("Error parsing config file");

    if let Some(path) = matches.value_of("socket") {
        config.socket_path = path.to_string();
    }

    // Initialize logging
    let logger = logging::init();

    logging::info!(logger, "starting ppp controller";
                   "socket" => &config.socket_path,
                   "services" => config.services.len());

    let mut server = Server::new(&config, &logger).expect("Error starting control server");

    if let Err(err) = server.run() {
        logging::crit!(logger, "reactor failed"; "error" => %err);
        std::process::exit(1);
    }
}
