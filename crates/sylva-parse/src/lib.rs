//! `sylva-parse` - Incremental GLR-style LR(1) parse engine.
//!
//! This crate interprets precompiled grammar tables over a chunked input
//! stream and produces flat tree buffers:
//!
//! - **Grammar tables**: validated, bit-packed state/action/goto tables
//! - **Tokenizers**: packed-DFA token groups plus external tokenizers
//! - **Parse stacks**: persistent, copy-on-split stacks with shared history
//! - **Driver**: GLR-style stack interleaving with insert/delete recovery
//!
//! # Design Principles
//!
//! - **Error-tolerant**: a parse never fails (outside strict mode); damage
//!   turns into error nodes and score penalties
//! - **Deterministic lookahead**: every position a decision depended on is
//!   recorded, so incremental reparses can invalidate precisely
//! - **Flat output**: stacks emit `(term, start, end, size)` records; trees
//!   are materialized once at acceptance by `sylva-tree`
//!
//! # Example
//!
//! ```ignore
//! use sylva_parse::{GrammarSpec, LrGrammar, LrParser};
//!
//! let spec: GrammarSpec = serde_json::from_str(tables_json)?;
//! let parser = LrParser::new(LrGrammar::from_spec(spec)?)?;
//! let tree = parser.parse("1+(2+3)");
//! assert!(!tree.has_error());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod constants;
pub mod context;
pub mod cursor;
pub mod grammar;
pub mod input;
pub mod parse;
pub mod stack;
pub mod token;

pub use sylva_tree::{NodeFlags, NodeSet, NodeType, Tree, ERROR_TERM};

pub use context::{ContextTracker, ContextValue, StackContext};
pub use cursor::StackBufferCursor;
pub use grammar::{
    Dialect, GrammarError, GrammarSpec, LrGrammar, NestedParse, TokenizerSpec, TopRule,
};
pub use input::{Gap, Input, InputStream, Token};
pub use parse::{LrParser, ParseError, ParseOptions, ParseSession};
pub use stack::{ParseShared, SimulatedStack, Stack, StackCx};
pub use token::{ExternalTokenizer, TokenGroup, Tokenizer};
