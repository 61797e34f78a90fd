// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! mcc: a small C compiler targeting Thumb-2 and the MIMI container.
//!
//! The pipeline is disk-buffered and multi-pass, shaped for a machine
//! where source, tokens, and code cannot all be resident at once:
//!
//! 1. [`lex`] streams source bytes (through the filesystem collaborator)
//!    into a temporary token stream file;
//! 2. [`parse`] streams the tokens back and builds an arena tree;
//! 3. [`gen`] walks the tree and emits a Thumb-2 object blob;
//! 4. [`link`] merges object blobs into a MIMI container.
//!
//! [`compile`] and [`link_objects`] drive the passes and own the temporary
//! files; [`build`] chains them source-to-container.

pub mod ast;
pub mod gen;
pub mod lex;
pub mod link;
pub mod obj;
pub mod parse;
pub mod strtab;
pub mod token;

use abi::ErrorCode;
use fs_api::{FileSys, FsError};
use log::{debug, warn};

pub use link::Mimi;
pub use obj::ObjectFile;

/// Diagnostics recorded past this count abort the pass.
pub const MAX_DIAGS: usize = 10;

/// One recorded diagnostic. `col` is exact for lexer errors and zero for
/// parser and codegen errors (the token stream keeps lines only).
#[derive(Debug, Clone)]
pub struct Diag {
    pub line: u16,
    pub col: u16,
    pub message: String,
}

/// Compiler-side errors. [`Error::code`] collapses these onto the wire
/// vocabulary the shell reports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("filesystem: {0:?}")]
    Fs(#[from] FsError),
    #[error("corrupt input: {0}")]
    Corrupt(&'static str),
    #[error("{} error(s), first at line {}: {}",
            .0.len(),
            .0.first().map(|d| d.line).unwrap_or(0),
            .0.first().map(|d| d.message.as_str()).unwrap_or(""))]
    Syntax(Vec<Diag>),
    #[error("link: {0}")]
    Link(String),
    #[error("no entry symbol `main`")]
    NoEntry,
    #[error("line {line}: {what} not supported")]
    NoSys { line: u16, what: String },
    #[error("{0}")]
    TooLarge(&'static str),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Fs(e) => e.code(),
            // Accumulated syntax and link errors surface as CORRUPT, per
            // the compile pipeline's contract with the shell.
            Error::Corrupt(_) | Error::Syntax(_) | Error::Link(_) => {
                ErrorCode::Corrupt
            }
            Error::NoEntry => ErrorCode::NoExec,
            Error::NoSys { .. } => ErrorCode::NoSys,
            Error::TooLarge(_) => ErrorCode::TooLarge,
        }
    }

    /// The diagnostics behind a syntax failure, if that is what this is.
    pub fn diags(&self) -> &[Diag] {
        match self {
            Error::Syntax(d) => d,
            _ => &[],
        }
    }
}

/// What [`compile`] reports on success.
#[derive(Copy, Clone, Debug)]
pub struct CompileStats {
    pub tokens: u32,
    pub text_size: u32,
    pub data_size: u32,
    pub relocs: u32,
    pub symbols: u32,
}

/// What [`link_objects`] reports on success.
#[derive(Copy, Clone, Debug)]
pub struct LinkStats {
    pub entry_offset: u32,
    pub text_size: u32,
    pub data_size: u32,
    pub reloc_count: u32,
    pub symbol_count: u32,
}

/// Compiles one C source file into an object blob at `object`.
///
/// The intermediate token stream lives in `<object>.tok` for the duration
/// of the call and is deleted on every path.
pub fn compile(
    fs: &mut dyn FileSys,
    source: &str,
    object: &str,
) -> Result<CompileStats, Error> {
    let tok_path = format!("{object}.tok");
    let result = lex::lex_to_stream(fs, source, &tok_path).and_then(|lexed| {
        let (unit, strtab) = parse::parse_stream(fs, &tok_path)?;
        let obj = gen::generate(&unit, &strtab)?;
        obj.write_to(fs, object)?;
        debug!("compiled {source} -> {object}");
        Ok(CompileStats {
            tokens: lexed.tokens,
            text_size: obj.text.len() as u32,
            data_size: obj.data.len() as u32,
            relocs: obj.relocs.len() as u32,
            symbols: obj.symbols.len() as u32,
        })
    });
    if fs.remove(&tok_path).is_err() && result.is_ok() {
        warn!("temporary token stream {tok_path} was not removed");
    }
    result
}

/// Links object blobs, in order, into a MIMI at `out`. The image name is
/// the output path's final component without its extension.
pub fn link_objects(
    fs: &mut dyn FileSys,
    objects: &[String],
    out: &str,
) -> Result<LinkStats, Error> {
    let mut units = Vec::with_capacity(objects.len());
    for path in objects {
        units.push(obj::ObjectFile::read_from(fs, path)?);
    }
    let name = image_name(out);
    let mimi = link::link_units(&units, name)?;
    mimi.write_to(fs, out)?;
    Ok(LinkStats {
        entry_offset: mimi.header.entry_offset,
        text_size: mimi.header.text_size,
        data_size: mimi.header.data_size,
        reloc_count: mimi.header.reloc_count,
        symbol_count: mimi.header.symbol_count,
    })
}

/// Compiles every source and links the results: the whole pipeline.
/// Object blobs are temporaries named after `out` and are deleted once
/// the linker has consumed them.
pub fn build(
    fs: &mut dyn FileSys,
    sources: &[String],
    out: &str,
) -> Result<LinkStats, Error> {
    let mut objects = Vec::with_capacity(sources.len());
    let mut result = Ok(());
    for (i, src) in sources.iter().enumerate() {
        let obj_path = format!("{out}.{i}.o");
        match compile(fs, src, &obj_path) {
            Ok(_) => objects.push(obj_path),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    let result = match result {
        Ok(()) => link_objects(fs, &objects, out),
        Err(e) => Err(e),
    };
    for path in &objects {
        let _ = fs.remove(path);
    }
    result
}

fn image_name(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split_once('.').map(|(stem, _)| stem).unwrap_or(file)
}
