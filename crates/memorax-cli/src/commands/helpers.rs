use std::io::Read;
use std::path::PathBuf;

use miette::{IntoDiagnostic, Result, WrapErr};

use memorax_machine::Machine;

/// Read, parse and compile a program from a file or stdin, optionally
/// converting to register free form.
pub(crate) fn load_machine(file: &Option<PathBuf>, rff: bool) -> Result<Machine> {
    let (source, name) = match file {
        Some(path) => (
            std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot read '{}'", path.display()))?,
            path.display().to_string(),
        ),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .into_diagnostic()
                .wrap_err("cannot read program from stdin")?;
            (buf, "<stdin>".to_owned())
        }
    };
    let program = memorax_dsl::parse(&source, &name).map_err(miette::Report::new)?;
    let machine = Machine::from_ast(&program, &source, &name).map_err(miette::Report::new)?;
    if rff {
        Ok(machine
            .remove_registers()
            .map_err(miette::Report::new)?
            .remove_superfluous_nops())
    } else {
        Ok(machine)
    }
}
