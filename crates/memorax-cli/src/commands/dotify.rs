use std::io::Write as _;
use std::process::Command;

use miette::{IntoDiagnostic, Result};

use crate::cli::Commands;
use crate::commands::helpers::load_machine;

pub(crate) fn run(command: Commands) -> Result<()> {
    let Commands::Dotify { file, output, rff } = command else {
        unreachable!("dispatched on the Dotify variant");
    };
    let machine = load_machine(&file, rff)?;
    let dot = machine.to_dot();

    let mut tmp = tempfile::NamedTempFile::new().into_diagnostic()?;
    tmp.write_all(dot.as_bytes()).into_diagnostic()?;
    tmp.flush().into_diagnostic()?;

    let status = Command::new("dot")
        .arg("-Tpdf")
        .arg(tmp.path())
        .arg("-o")
        .arg(&output)
        .status();
    match status {
        Ok(s) if s.success() => println!("Wrote pdf to {}", output.display()),
        _ => println!("Failed to dotify automata (is graphviz installed?)"),
    }
    Ok(())
}
