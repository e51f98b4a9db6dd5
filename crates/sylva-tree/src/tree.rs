//! Persistent syntax trees and the flat parse-buffer contract.
//!
//! The parse engine does not build trees directly. It appends 4-word records
//! `(term, start, end, size)` to a flat buffer, youngest last, and hands the
//! finished buffer to [`Tree::build`] through a reverse [`BufferCursor`].
//! `size` counts the words covered by a record including itself and all of
//! its descendants, so a childless node has size 4. Negative sizes are
//! sentinels:
//!
//! - [`SIZE_REUSED`]: a prebuilt subtree; `term` indexes the shared reused
//!   table, `start`/`end` bound the subtree.
//! - [`SIZE_PROP`]: a property attachment for the node that precedes it;
//!   `term` indexes the shared property-value table, `end` is the property id.
//! - [`SIZE_CONTEXT`]: a context-hash marker; `term` is the hash.
//! - [`SIZE_LOOKAHEAD`]: a lookahead marker; `term` is the position that
//!   influenced decisions up to this point.
//!
//! Any producer of this format can be consumed by the builder, and any
//! consumer honoring these conventions can replace it.

use std::fmt;
use std::rc::Rc;

use text_size::{TextRange, TextSize};

use crate::node::{NodeSet, NodeType, ERROR_TERM};

/// Record size sentinel: a reused subtree.
pub const SIZE_REUSED: i32 = -1;
/// Record size sentinel: a property attachment.
pub const SIZE_PROP: i32 = -2;
/// Record size sentinel: a context-hash marker.
pub const SIZE_CONTEXT: i32 = -3;
/// Record size sentinel: a lookahead marker.
pub const SIZE_LOOKAHEAD: i32 = -4;

/// Property id for a mounted tree (a nested parse attached to a node).
pub const PROP_MOUNTED: u16 = 0;

/// Reverse iterator over a flat record buffer.
///
/// Implementations expose the record the cursor currently rests on through
/// the four word accessors, move to the previous record with [`next`], and
/// report the absolute word offset just past the current record with
/// [`pos`]. A cursor at offset 0 is exhausted.
///
/// [`next`]: BufferCursor::next
/// [`pos`]: BufferCursor::pos
pub trait BufferCursor {
    /// The `term` word of the current record.
    fn id(&self) -> i32;
    /// The `start` word of the current record.
    fn start(&self) -> i32;
    /// The `end` word of the current record.
    fn end(&self) -> i32;
    /// The `size` word of the current record.
    fn size(&self) -> i32;
    /// The absolute word offset just past the current record.
    fn pos(&self) -> usize;
    /// Moves to the record before the current one.
    fn next(&mut self);
    /// Duplicates the cursor without affecting this one.
    fn fork(&self) -> Self
    where
        Self: Sized;
}

/// A [`BufferCursor`] over a plain in-memory buffer.
#[derive(Debug, Clone)]
pub struct FlatBufferCursor<'a> {
    buffer: &'a [i32],
    index: usize,
}

impl<'a> FlatBufferCursor<'a> {
    /// Creates a cursor positioned on the last record of `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer length is not a multiple of 4.
    #[must_use]
    pub fn new(buffer: &'a [i32]) -> Self {
        assert!(buffer.len() % 4 == 0, "malformed record buffer");
        Self {
            buffer,
            index: buffer.len(),
        }
    }
}

impl BufferCursor for FlatBufferCursor<'_> {
    fn id(&self) -> i32 {
        self.buffer[self.index - 4]
    }

    fn start(&self) -> i32 {
        self.buffer[self.index - 3]
    }

    fn end(&self) -> i32 {
        self.buffer[self.index - 2]
    }

    fn size(&self) -> i32 {
        self.buffer[self.index - 1]
    }

    fn pos(&self) -> usize {
        self.index
    }

    fn next(&mut self) {
        self.index -= 4;
    }

    fn fork(&self) -> Self {
        self.clone()
    }
}

/// Everything [`Tree::build`] needs besides the cursor itself.
pub struct BuildParams<'a> {
    /// The node types of the grammar that produced the buffer.
    pub node_set: &'a NodeSet,
    /// The term id of the root node.
    pub top: u16,
    /// Absolute position where the covered input begins.
    pub start: u32,
    /// Length of the covered input.
    pub length: u32,
    /// The shared reused-subtree table ([`SIZE_REUSED`] records index it).
    pub reused: &'a [Rc<Tree>],
    /// The shared property-value table ([`SIZE_PROP`] records index it).
    pub prop_values: &'a [Rc<Tree>],
    /// First repeat-term id. Records at or above it are balance helpers and
    /// become anonymous groups.
    pub min_repeat_term: u16,
}

/// A syntax tree node.
///
/// Trees are immutable and shared via `Rc`; child positions are stored
/// relative to the parent so a subtree can be reused at a different
/// absolute position without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    kind: NodeType,
    children: Vec<Rc<Tree>>,
    positions: Vec<u32>,
    len: u32,
    context_hash: u32,
    look_ahead: u32,
    props: Vec<(u16, Rc<Tree>)>,
}

impl Tree {
    /// Creates an interior node. `positions[i]` is the offset of
    /// `children[i]` from this node's start.
    ///
    /// # Panics
    ///
    /// Panics if `children` and `positions` disagree in length.
    #[must_use]
    pub fn new(kind: NodeType, children: Vec<Rc<Tree>>, positions: Vec<u32>, len: u32) -> Self {
        assert_eq!(children.len(), positions.len());
        Self {
            kind,
            children,
            positions,
            len,
            context_hash: 0,
            look_ahead: 0,
            props: Vec::new(),
        }
    }

    /// Creates a childless node of the given length.
    #[must_use]
    pub fn leaf(kind: NodeType, len: u32) -> Self {
        Self::new(kind, Vec::new(), Vec::new(), len)
    }

    /// The node's type.
    #[must_use]
    pub fn kind(&self) -> &NodeType {
        &self.kind
    }

    /// The node's length, in input code units.
    #[must_use]
    pub fn len(&self) -> TextSize {
        TextSize::from(self.len)
    }

    /// Returns `true` if the node spans no input.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The child nodes, in source order.
    #[must_use]
    pub fn children(&self) -> &[Rc<Tree>] {
        &self.children
    }

    /// The range of child `index`, relative to this node's start.
    #[must_use]
    pub fn child_range(&self, index: usize) -> TextRange {
        let start = TextSize::from(self.positions[index]);
        TextRange::at(start, self.children[index].len())
    }

    /// The offset of child `index` from this node's start.
    #[must_use]
    pub fn child_offset(&self, index: usize) -> u32 {
        self.positions[index]
    }

    /// The context-tracker hash in effect when this node was finished, or 0.
    #[must_use]
    pub fn context_hash(&self) -> u32 {
        self.context_hash
    }

    /// The furthest position that influenced this node, or 0 when the parse
    /// never looked past its end.
    #[must_use]
    pub fn look_ahead(&self) -> u32 {
        self.look_ahead
    }

    /// The node's attached properties, as `(prop id, value)` pairs.
    #[must_use]
    pub fn props(&self) -> &[(u16, Rc<Tree>)] {
        &self.props
    }

    /// The tree mounted on this node by a nested parse, if any.
    #[must_use]
    pub fn mounted(&self) -> Option<&Rc<Tree>> {
        self.props
            .iter()
            .find(|(id, _)| *id == PROP_MOUNTED)
            .map(|(_, tree)| tree)
    }

    /// Returns a copy of this node with `props` appended.
    #[must_use]
    pub fn with_props(&self, props: Vec<(u16, Rc<Tree>)>) -> Self {
        let mut copy = self.clone();
        copy.props.extend(props);
        copy
    }

    /// Returns `true` if this subtree contains an error node.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.kind.is_error() || self.children.iter().any(|child| child.has_error())
    }

    /// Builds a tree from a record buffer, walked in reverse through
    /// `cursor`. See the module docs for the record format.
    #[must_use]
    pub fn build<C: BufferCursor>(cursor: C, params: &BuildParams<'_>) -> Tree {
        let mut builder = Builder {
            cursor,
            params,
            context_hash: 0,
            look_ahead: 0,
            pending_props: Vec::new(),
        };
        let mut children = Vec::new();
        let mut positions = Vec::new();
        while builder.cursor.pos() > 0 {
            builder.take_node(params.start as i32, &mut children, &mut positions);
        }
        children.reverse();
        positions.reverse();
        let kind = params
            .node_set
            .get(params.top)
            .cloned()
            .unwrap_or_else(|| params.node_set.types()[ERROR_TERM as usize].clone());
        Tree::new(kind, children, positions, params.length)
    }

    /// Renders the tree in the `Kind@start..end` indented form used by
    /// snapshot tests. Anonymous groups are looked through.
    #[must_use]
    pub fn to_debug_string(&self) -> String {
        let mut out = String::new();
        self.fmt_node(&mut out, 0, 0);
        out
    }

    fn fmt_node(&self, out: &mut String, offset: u32, depth: usize) {
        use fmt::Write as _;

        if self.kind.is_anonymous() {
            for (index, child) in self.children.iter().enumerate() {
                child.fmt_node(out, offset + self.positions[index], depth);
            }
            return;
        }
        let _ = writeln!(
            out,
            "{}{}@{}..{}",
            "  ".repeat(depth),
            self.kind.name(),
            offset,
            offset + self.len
        );
        if let Some(mounted) = self.mounted() {
            let _ = writeln!(out, "{}<mounted>", "  ".repeat(depth + 1));
            mounted.fmt_node(out, offset, depth + 2);
        }
        for (index, child) in self.children.iter().enumerate() {
            child.fmt_node(out, offset + self.positions[index], depth + 1);
        }
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_debug_string().trim_end())
    }
}

struct Builder<'a, C> {
    cursor: C,
    params: &'a BuildParams<'a>,
    context_hash: u32,
    look_ahead: u32,
    pending_props: Vec<(u16, Rc<Tree>)>,
}

impl<C: BufferCursor> Builder<'_, C> {
    /// Consumes one record (plus, for node records, everything it covers)
    /// and appends the resulting child in reverse source order.
    fn take_node(&mut self, parent_start: i32, children: &mut Vec<Rc<Tree>>, positions: &mut Vec<u32>) {
        let (id, start, end, size) = (
            self.cursor.id(),
            self.cursor.start(),
            self.cursor.end(),
            self.cursor.size(),
        );
        if size < 0 {
            self.cursor.next();
            match size {
                SIZE_REUSED => {
                    let tree = &self.params.reused[id as usize];
                    let tree = self.attach_pending(tree);
                    children.push(tree);
                    positions.push((start - parent_start) as u32);
                }
                SIZE_PROP => {
                    let value = Rc::clone(&self.params.prop_values[id as usize]);
                    self.pending_props.push((end as u16, value));
                }
                SIZE_CONTEXT => self.context_hash = id as u32,
                SIZE_LOOKAHEAD => self.look_ahead = id as u32,
                _ => debug_assert!(false, "unknown buffer sentinel {size}"),
            }
            return;
        }

        let context_at_start = self.context_hash;
        let look_ahead_at_start = self.look_ahead;
        let end_pos = self.cursor.pos() - size as usize;
        self.cursor.next();

        let term = id as u16;
        let repeat = term >= self.params.min_repeat_term;
        let mut local_children = Vec::new();
        let mut local_positions = Vec::new();
        while self.cursor.pos() > end_pos {
            // Nested applications of the same repeat term are flattened into
            // one group instead of a left-leaning chain.
            if repeat && self.cursor.id() == id && self.cursor.size() >= 0 {
                self.cursor.next();
            } else {
                self.take_node(start, &mut local_children, &mut local_positions);
            }
        }
        local_children.reverse();
        local_positions.reverse();

        let kind = self
            .params
            .node_set
            .get(term)
            .cloned()
            .unwrap_or_else(|| self.params.node_set.types()[ERROR_TERM as usize].clone());
        let mut tree = Tree::new(kind, local_children, local_positions, (end - start) as u32);
        tree.context_hash = context_at_start;
        tree.look_ahead = look_ahead_at_start;
        let tree = self.attach_pending(&Rc::new(tree));
        children.push(tree);
        positions.push((start - parent_start) as u32);
    }

    /// Attaches any pending property records to the node they followed.
    fn attach_pending(&mut self, tree: &Rc<Tree>) -> Rc<Tree> {
        if self.pending_props.is_empty() {
            return Rc::clone(tree);
        }
        let props = std::mem::take(&mut self.pending_props);
        Rc::new(tree.with_props(props))
    }
}
