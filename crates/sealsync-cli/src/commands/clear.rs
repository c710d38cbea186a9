//! Clear command handler

use std::io::{self, Write};

use anyhow::Result;

use crate::engine::{parse_document_id, Engine};
use crate::output::Output;

/// Wipe the local cache of a document
pub fn run(engine: &Engine, document: &str, force: bool, output: &Output) -> Result<()> {
    let document_id = parse_document_id(document)?;
    let unpushed = engine.store().unpushed_count(&document_id)?;

    if unpushed > 0 && !force {
        if !output.should_prompt() {
            anyhow::bail!(
                "{} has {} unpushed op(s). Re-run with --force to discard them.",
                document_id,
                unpushed
            );
        }
        print!(
            "{} has {} op(s) the relay has not seen. Discard them? [y/N] ",
            document_id, unpushed
        );
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            output.message("Aborted.");
            return Ok(());
        }
    }

    engine.store().clear_document(&document_id)?;
    output.success(&format!("Cleared local state for {}", document_id));
    Ok(())
}
