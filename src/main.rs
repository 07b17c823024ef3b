use core::error::Error;
use std::sync::Arc;

use clap::Parser;
use volley::{cfg::Config, cmd::Cmd, engine::Engine, report};

pub fn main() {
    let cmd = Cmd::parse();
    volley::logging::init(cmd.verbose as usize).unwrap();

    if let Err(err) = run(cmd) {
        log::error!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Box<dyn Error>> {
    // A peer resetting a connection mid-write must surface as EPIPE, not
    // kill the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let cfg: Config = cmd.try_into()?;
    let cfg = Arc::new(cfg);

    println!("starting benchmark...");

    let engine = Engine::new(cfg.clone())?;
    let summary = engine.run()?;

    report::print(&cfg, &summary);

    Ok(())
}
