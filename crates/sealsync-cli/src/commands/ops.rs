//! Ops command handler

use anyhow::Result;

use crate::engine::{parse_document_id, Engine};
use crate::output::Output;

/// List ops the relay has not acknowledged yet
pub fn list(engine: &Engine, document: &str, output: &Output) -> Result<()> {
    let document_id = parse_document_id(document)?;
    let ops = engine.store().unpushed_ops(&document_id)?;
    output.print_ops(&ops);
    Ok(())
}
