//! Interactive confirmation.

use std::io::{BufRead, Write};

use colored::Colorize;

use strata_core::Error;

use crate::handler::CliError;

/// Ask the user to confirm a modifying operation.
///
/// `yes` proceeds, `no`/`n` aborts with [`Error::NotApproved`], empty lines
/// re-prompt, and closed input aborts. With `auto_approve` the question is
/// skipped; without available input the operation fails instead of hanging.
pub fn ask_for_confirmation(message: &str, auto_approve: bool, input: bool) -> Result<(), CliError> {
    if auto_approve {
        return Ok(());
    }
    if !input {
        return Err(Error::other(
            "cannot confirm change, neither auto-approve nor input flags are set",
        )
        .into());
    }
    let stdin = std::io::stdin();
    confirm_from(&mut stdin.lock(), message).map_err(CliError::Core)
}

fn confirm_from(reader: &mut impl BufRead, message: &str) -> Result<(), Error> {
    loop {
        eprint!("\n{} ", format!("{message} [yes/no]:").red());
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::other(format!("cannot read from stdin: {e}")))?;
        if read == 0 {
            return Err(Error::other("cannot read from stdin: input closed"));
        }
        match line.trim() {
            "yes" => return Ok(()),
            "no" | "n" => return Err(Error::NotApproved),
            _ => continue,
        }
    }
}
