//! ferryd: receive files from ferry clients until interrupted.
//!
//! Usage: `ferryd <ADDRESS> <PORT> <DIRECTORY>`

use anyhow::Result;
use std::process::ExitCode;

use ferry::fsm;
use ferry::server::ServerSession;

fn main() -> Result<ExitCode> {
    let mut session = ServerSession::new(std::env::args_os());
    let completion = fsm::run(&mut session)?;
    Ok(completion.into_exit_code())
}
