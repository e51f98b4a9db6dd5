//! `sylva-tree` - Node types, the parse-buffer contract, and syntax trees.
//!
//! This crate holds the data model shared between the parse engine and tree
//! consumers:
//!
//! - **Node types**: per-grammar tables of node kinds with classification
//!   flags
//! - **Buffer contract**: the flat `(term, start, end, size)` record format
//!   parse stacks emit, with its negative-size sentinels
//! - **Trees**: immutable, `Rc`-shared syntax trees built from a record
//!   buffer walked in reverse
//!
//! # Design Principles
//!
//! - **Flat first**: parse output is a flat buffer; trees are materialized
//!   once, at the end, by [`Tree::build`]
//! - **Position independence**: child offsets are parent-relative so
//!   subtrees can be reused at other absolute positions
//! - **Error-tolerant**: error nodes are ordinary nodes; a damaged parse
//!   still yields a tree

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod node;
pub mod tree;

pub use node::{NodeFlags, NodeSet, NodeType, ERROR_TERM};
pub use tree::{
    BufferCursor, BuildParams, FlatBufferCursor, Tree, PROP_MOUNTED, SIZE_CONTEXT, SIZE_LOOKAHEAD,
    SIZE_PROP, SIZE_REUSED,
};
