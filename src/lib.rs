//! Bytecode generation core for the Garnet scripting language.
//!
//! The generator consumes the syntax tree produced by a front-end parser and
//! emits executable procedure units ([`Irep`]): fixed-width register-machine
//! instructions together with literal pools, symbol tables, nested
//! sub-procedures, and source-location tables. Lexing, parsing, and the VM
//! that executes the output live elsewhere; this crate only defines their
//! contracts (the [`ast`] node types, the [`SymbolTable`] trait, and the
//! [`Irep`] layout).

use fnv::FnvHashMap;
use std::fmt;

pub mod ast;
mod gen;
pub mod irep;
pub mod op;
mod peep;
mod scope;
#[cfg(test)]
mod tests;

pub use irep::{FileSpan, Irep, LocalVar, Value};

/// A symbol table that can convert identifiers to symbols.
///
/// Symbols are owned by the embedding runtime and must stay stable for its
/// lifetime; the generator only compares and copies them.
pub trait SymbolTable {
    type Symbol: fmt::Debug + Copy + PartialEq;
    fn symbol(&mut self, name: &str) -> Self::Symbol;
    fn symbol_name(&self, symbol: Self::Symbol) -> Option<&str>;
}

/// A symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(usize);

/// A plain interning table for embedders without their own runtime interner.
#[derive(Debug, Default)]
pub struct Symbols {
    table: FnvHashMap<String, Symbol>,
    names: Vec<String>,
}

impl Symbols {
    pub fn new() -> Symbols {
        Symbols::default()
    }
}

impl SymbolTable for Symbols {
    type Symbol = Symbol;

    fn symbol(&mut self, name: &str) -> Symbol {
        match self.table.get(name) {
            Some(sym) => *sym,
            None => {
                let sym = Symbol(self.names.len());
                self.names.push(name.to_string());
                self.table.insert(name.to_string(), sym);
                sym
            }
        }
    }

    fn symbol_name(&self, symbol: Symbol) -> Option<&str> {
        self.names.get(symbol.0).map(|s| &**s)
    }
}

/// Front-end output handed to [`generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParserState<S> {
    /// The root node; must be a [`ast::NodeKind::Scope`].
    pub tree: ast::Node<S>,
    /// Source files, indexed by each node's `filename_index`.
    pub filenames: Vec<String>,
    /// File the program unit starts in.
    pub filename_index: u16,
    /// Disables the peephole pass.
    pub no_optimize: bool,
}

/// A fatal code generation error. No partial output is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CodegenError {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: u16,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.filename {
            Some(name) if self.lineno > 0 => {
                write!(f, "codegen error:{}:{}: {}", name, self.lineno, self.message)
            }
            _ => write!(f, "codegen error: {}", self.message),
        }
    }
}

/// Compiles a parsed program into its root procedure unit.
pub fn generate<T: SymbolTable>(
    symbols: &mut T,
    parser: &ParserState<T::Symbol>,
) -> Result<Irep<T>, CodegenError> {
    gen::Generator::new(symbols, parser).generate(&parser.tree)
}
