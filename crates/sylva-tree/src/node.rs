//! Node types and node sets.
//!
//! A grammar assigns every term that produces a tree node a small integer id.
//! `NodeType` carries the id together with a display name and a handful of
//! classification flags; `NodeSet` is the dense id-indexed table shipped with
//! a grammar and consulted by the tree builder.

use smol_str::SmolStr;

/// The id of the error node type. Every grammar reserves term 0 for it.
pub const ERROR_TERM: u16 = 0;

// A minimal flags newtype. The set of flags is closed, so a handwritten
// macro beats pulling in a dependency for four constants.
macro_rules! bit_flags {
    ($(#[$meta:meta])* pub struct $name:ident: $repr:ty {
        $($(#[$fmeta:meta])* const $flag:ident = $value:expr;)*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            /// The empty flag set.
            #[must_use]
            pub const fn empty() -> Self {
                $name(0)
            }

            /// Returns `true` if every flag in `other` is set in `self`.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bit_flags! {
    /// Classification flags carried by a [`NodeType`].
    pub struct NodeFlags: u8 {
        /// The type of a grammar's top rule.
        const TOP = 1 << 0;
        /// Skipped content (whitespace, comments) that does not take part in
        /// reduction boundaries.
        const SKIPPED = 1 << 1;
        /// The error type used for recovery nodes.
        const ERROR = 1 << 2;
        /// A nameless helper type that tree consumers should look through.
        const ANONYMOUS = 1 << 3;
    }
}

/// A node type: the static description of one kind of tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeType {
    id: u16,
    name: SmolStr,
    flags: NodeFlags,
}

impl NodeType {
    /// Creates a node type.
    #[must_use]
    pub fn new(id: u16, name: impl Into<SmolStr>, flags: NodeFlags) -> Self {
        let name = name.into();
        let flags = if name.is_empty() {
            flags | NodeFlags::ANONYMOUS
        } else {
            flags
        };
        Self { id, name, flags }
    }

    /// The placeholder type used for tree nodes that stand in for input
    /// gaps. Created once per parse, outside any grammar's node set.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(u16::MAX, "Placeholder", NodeFlags::SKIPPED)
    }

    /// The id of this type within its grammar's node set.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The display name. Empty for anonymous types.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if this is a top-rule type.
    #[must_use]
    pub fn is_top(&self) -> bool {
        self.flags.contains(NodeFlags::TOP)
    }

    /// Returns `true` if this type marks skipped content.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.flags.contains(NodeFlags::SKIPPED)
    }

    /// Returns `true` if this is the error type.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.flags.contains(NodeFlags::ERROR)
    }

    /// Returns `true` if this type has no name of its own.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.flags.contains(NodeFlags::ANONYMOUS)
    }
}

/// The dense table of node types belonging to one grammar.
///
/// Index `i` holds the type for term id `i`. Terms above the node range
/// (non-node terminals, the end-of-input term) have no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    types: Vec<NodeType>,
}

impl NodeSet {
    /// Creates a node set from a dense list of types. The id of each type
    /// must equal its index.
    ///
    /// # Panics
    ///
    /// Panics if a type's id disagrees with its position.
    #[must_use]
    pub fn new(types: Vec<NodeType>) -> Self {
        for (index, ty) in types.iter().enumerate() {
            assert_eq!(
                ty.id() as usize,
                index,
                "node type id {} out of place at index {index}",
                ty.id()
            );
        }
        Self { types }
    }

    /// The type for term `id`, or `None` when `id` is outside the node range.
    #[must_use]
    pub fn get(&self, id: u16) -> Option<&NodeType> {
        self.types.get(id as usize)
    }

    /// All types, in id order.
    #[must_use]
    pub fn types(&self) -> &[NodeType] {
        &self.types
    }

    /// The number of node types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
