//! ferry: send files, in order, to a ferryd receiver.
//!
//! Usage: `ferry <ADDRESS> <PORT> <FILE>...`

use anyhow::Result;
use std::process::ExitCode;

use ferry::client::ClientSession;
use ferry::fsm;

fn main() -> Result<ExitCode> {
    let mut session = ClientSession::new(std::env::args_os());
    let completion = fsm::run(&mut session)?;
    Ok(completion.into_exit_code())
}
