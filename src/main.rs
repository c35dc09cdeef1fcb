use std::convert::TryFrom;
use std::process;

use anyhow::Result;

mod config;
mod executor;
mod iovec;
mod proto;
mod server;
mod taint;

use config::Config;
use server::CommandServer;

fn run() -> Result<()> {
    let matches = config::app().get_matches();
    let config = Config::try_from(&matches)?;

    CommandServer::new(config).run()
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
