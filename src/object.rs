//! Object files: a linked [`Program`] written to disk.
//!
//! Layout is the 4-byte magic `CBRA` followed by the postcard encoding of the
//! program, so the entry address travels with the code.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::bytecode::ir::Program;

pub const MAGIC: &[u8; 4] = b"CBRA";

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("not a cobra object file (bad magic)")]
    BadMagic,

    #[error("malformed object file: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("entry address {entry} is outside the {size}-byte image")]
    BadEntry { entry: u32, size: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// True when `bytes` start with the object-file magic.
pub fn is_object(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

pub fn encode(program: &Program) -> Result<Vec<u8>, ObjectError> {
    let mut bytes = MAGIC.to_vec();
    let body = postcard::to_allocvec(program)?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Program, ObjectError> {
    let body = bytes.strip_prefix(MAGIC.as_slice()).ok_or(ObjectError::BadMagic)?;
    let program: Program = postcard::from_bytes(body)?;

    if program.entry_address as usize >= program.code.len() {
        return Err(ObjectError::BadEntry {
            entry: program.entry_address,
            size: program.code.len(),
        });
    }
    Ok(program)
}

pub fn write_to(path: &Path, program: &Program) -> Result<(), ObjectError> {
    fs::write(path, encode(program)?)?;
    Ok(())
}

pub fn read_from(path: &Path) -> Result<Program, ObjectError> {
    decode(&fs::read(path)?)
}
