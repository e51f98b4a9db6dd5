//! Precompiled grammar tables and their loader.
//!
//! A grammar arrives as a [`GrammarSpec`]: dense state records, packed
//! action sequences, a goto table, tokenizer DFA data, and node metadata.
//! [`LrGrammar::from_spec`] validates the spec and produces the read-only
//! table object the engine interprets. Grammar compilation itself happens
//! elsewhere; this module only checks and serves tables.

use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use sylva_tree::{NodeFlags, NodeSet, NodeType, Tree, ERROR_TERM};

use crate::constants::{action, pair, seq, state_slot};
use crate::context::ContextTracker;
use crate::input::InputStream;
use crate::stack::Stack;
use crate::token::{TokenGroup, Tokenizer};

/// The table format version this engine interprets.
pub const FORMAT_VERSION: u32 = 1;

/// A factory that may produce a prebuilt subtree for a nested language
/// region, given the input, the requesting stack, and the region bounds.
pub type NestedParse = Rc<dyn Fn(&mut InputStream<'_>, &Stack, u32, u32) -> Option<Tree>>;

/// Errors raised while loading a [`GrammarSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    /// The spec was produced for another format version.
    #[error("unsupported table format version {found} (expected {FORMAT_VERSION})")]
    UnsupportedVersion {
        /// The version the spec declares.
        found: u32,
    },

    /// The state table length is not a multiple of the record size.
    #[error("malformed state table of length {0}")]
    MalformedStates(usize),

    /// The spec declares no node types (term 0 must be the error type).
    #[error("grammar has no node types")]
    NoNodeTypes,

    /// More repeat node types than node types.
    #[error("repeat node count {count} exceeds node count {nodes}")]
    BadRepeatCount {
        /// Declared number of repeat types.
        count: u16,
        /// Total number of node types.
        nodes: usize,
    },

    /// A top rule points at a state or term outside the tables.
    #[error("top rule '{0}' is out of bounds")]
    BadTopRule(SmolStr),

    /// A skip-node entry names a term without a node type.
    #[error("skipped node {0} has no node type")]
    BadSkippedNode(u16),

    /// A dialect lists a term beyond `max_term`.
    #[error("dialect '{name}' mentions unknown term {term}")]
    BadDialectTerm {
        /// Dialect name.
        name: SmolStr,
        /// Offending term.
        term: u16,
    },

    /// An external tokenizer slot was never resolved.
    #[error("external tokenizer '{0}' was not provided")]
    UnresolvedTokenizer(SmolStr),

    /// A dialect name passed to [`LrGrammar::with_dialects`] is unknown.
    #[error("unknown dialect '{0}'")]
    UnknownDialect(SmolStr),
}

/// One top rule: its start state and the term of the tree it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopRule {
    /// The LR state parsing starts in.
    pub state: u32,
    /// The node term of the produced root.
    pub term: u16,
}

/// A tokenizer slot in a spec: either a group of the shared token DFA or a
/// named external tokenizer resolved at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerSpec {
    /// Interpret the shared DFA data with this group id.
    Group(u16),
    /// Resolved through [`LrGrammar::resolve_tokenizer`].
    External(String),
}

/// The serializable form of a precompiled grammar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarSpec {
    /// Table format version; must equal [`FORMAT_VERSION`].
    pub version: u32,
    /// Dense per-state records, [`state_slot::COUNT`] words each.
    pub states: Vec<u32>,
    /// Packed action sequences referenced from the state records.
    pub data: Vec<u16>,
    /// The goto table (see [`LrGrammar::get_goto`] for the layout).
    pub goto_table: Vec<u16>,
    /// Node type names, indexed by term id. Index 0 is the error type.
    pub node_names: Vec<String>,
    /// Terms whose nodes mark skipped content.
    pub skipped_nodes: Vec<u16>,
    /// Number of trailing node types that are repeat helpers.
    pub repeat_node_count: u16,
    /// Highest term id in use.
    pub max_term: u16,
    /// The synthetic end-of-input term.
    pub eof_term: u16,
    /// Named top rules; the first is the default.
    pub top_rules: IndexMap<String, TopRule>,
    /// Per-term dynamic precedence values.
    pub dynamic_precedences: Vec<(u16, i32)>,
    /// Token terms in precedence order, used for override decisions.
    pub token_prec: Vec<u16>,
    /// Packed DFA data shared by all [`TokenizerSpec::Group`] tokenizers.
    pub token_data: Vec<u16>,
    /// Tokenizers in the order the per-state tokenizer mask refers to.
    pub tokenizers: Vec<TokenizerSpec>,
    /// Dialect names mapped to the terms they enable.
    pub dialects: IndexMap<String, Vec<u16>>,
}

enum TokenizerSlot {
    Ready(Rc<dyn Tokenizer>),
    Pending(SmolStr),
}

/// The dialect configuration of a grammar instance.
#[derive(Debug, Clone, Default)]
pub struct Dialect {
    flags: Vec<bool>,
    disabled: Option<Vec<u8>>,
}

impl Dialect {
    /// Returns `true` if `term` is available under this configuration.
    #[must_use]
    pub fn allows(&self, term: u16) -> bool {
        match &self.disabled {
            None => true,
            Some(disabled) => disabled.get(term as usize).copied().unwrap_or(0) == 0,
        }
    }

    /// Returns `true` if the dialect with this index is enabled.
    #[must_use]
    pub fn enabled(&self, id: usize) -> bool {
        self.flags.get(id).copied().unwrap_or(false)
    }
}

/// A loaded, validated grammar: the read-only tables the engine interprets.
pub struct LrGrammar {
    states: Rc<[u32]>,
    data: Rc<[u16]>,
    goto_table: Rc<[u16]>,
    node_set: NodeSet,
    min_repeat_term: u16,
    max_node: u16,
    max_term: u16,
    eof_term: u16,
    top_rules: IndexMap<SmolStr, TopRule>,
    dynamic_prec: FxHashMap<u16, i32>,
    token_prec: Vec<u16>,
    tokenizers: Vec<TokenizerSlot>,
    dialect_names: Vec<SmolStr>,
    dialect_terms: Vec<Vec<u16>>,
    dialect: Dialect,
    nested: FxHashMap<u16, NestedParse>,
    context: Option<Rc<dyn ContextTracker>>,
}

impl LrGrammar {
    /// Validates a spec and builds the grammar.
    pub fn from_spec(spec: GrammarSpec) -> Result<Self, GrammarError> {
        if spec.version != FORMAT_VERSION {
            return Err(GrammarError::UnsupportedVersion {
                found: spec.version,
            });
        }
        if spec.states.is_empty() || spec.states.len() % state_slot::COUNT as usize != 0 {
            return Err(GrammarError::MalformedStates(spec.states.len()));
        }
        if spec.node_names.is_empty() {
            return Err(GrammarError::NoNodeTypes);
        }
        let node_count = spec.node_names.len();
        if spec.repeat_node_count as usize > node_count {
            return Err(GrammarError::BadRepeatCount {
                count: spec.repeat_node_count,
                nodes: node_count,
            });
        }
        let state_count = (spec.states.len() / state_slot::COUNT as usize) as u32;
        for (name, rule) in &spec.top_rules {
            if rule.state >= state_count || rule.term as usize >= node_count {
                return Err(GrammarError::BadTopRule(name.as_str().into()));
            }
        }
        for &term in &spec.skipped_nodes {
            if term as usize >= node_count {
                return Err(GrammarError::BadSkippedNode(term));
            }
        }
        for (name, terms) in &spec.dialects {
            for &term in terms {
                if term > spec.max_term {
                    return Err(GrammarError::BadDialectTerm {
                        name: name.as_str().into(),
                        term,
                    });
                }
            }
        }

        let mut types = Vec::with_capacity(node_count);
        for (id, name) in spec.node_names.iter().enumerate() {
            let id = id as u16;
            let mut flags = NodeFlags::empty();
            if id == ERROR_TERM {
                flags = flags | NodeFlags::ERROR;
            }
            if spec.top_rules.values().any(|rule| rule.term == id) {
                flags = flags | NodeFlags::TOP;
            }
            if spec.skipped_nodes.contains(&id) {
                flags = flags | NodeFlags::SKIPPED;
            }
            types.push(NodeType::new(id, name.as_str(), flags));
        }

        let token_data: Rc<[u16]> = spec.token_data.into();
        let tokenizers = spec
            .tokenizers
            .iter()
            .map(|slot| match slot {
                TokenizerSpec::Group(group) => TokenizerSlot::Ready(Rc::new(TokenGroup::new(
                    Rc::clone(&token_data),
                    u32::from(*group),
                ))
                    as Rc<dyn Tokenizer>),
                TokenizerSpec::External(name) => TokenizerSlot::Pending(name.as_str().into()),
            })
            .collect();

        Ok(Self {
            states: spec.states.into(),
            data: spec.data.into(),
            goto_table: spec.goto_table.into(),
            node_set: NodeSet::new(types),
            min_repeat_term: (node_count - spec.repeat_node_count as usize) as u16,
            max_node: (node_count - 1) as u16,
            max_term: spec.max_term,
            eof_term: spec.eof_term,
            top_rules: spec
                .top_rules
                .into_iter()
                .map(|(name, rule)| (SmolStr::from(name), rule))
                .collect(),
            dynamic_prec: spec.dynamic_precedences.into_iter().collect(),
            token_prec: spec.token_prec,
            tokenizers,
            dialect_names: spec.dialects.keys().map(|name| name.as_str().into()).collect(),
            dialect_terms: spec.dialects.into_values().collect(),
            dialect: Dialect::default(),
            nested: FxHashMap::default(),
            context: None,
        })
    }

    /// Provides the implementation for the external tokenizer slot `name`.
    pub fn resolve_tokenizer(
        &mut self,
        name: &str,
        tokenizer: Rc<dyn Tokenizer>,
    ) -> Result<(), GrammarError> {
        let found = self
            .tokenizers
            .iter()
            .position(|slot| matches!(slot, TokenizerSlot::Pending(pending) if pending.as_str() == name));
        match found {
            Some(index) => {
                self.tokenizers[index] = TokenizerSlot::Ready(tokenizer);
                Ok(())
            }
            None => Err(GrammarError::UnresolvedTokenizer(name.into())),
        }
    }

    /// Returns the name of the first tokenizer slot still waiting for an
    /// external implementation.
    #[must_use]
    pub fn unresolved_tokenizer(&self) -> Option<&SmolStr> {
        self.tokenizers.iter().find_map(|slot| match slot {
            TokenizerSlot::Pending(name) => Some(name),
            TokenizerSlot::Ready(_) => None,
        })
    }

    /// Registers a nested-parse factory for `term`.
    pub fn set_nested(&mut self, term: u16, factory: NestedParse) {
        self.nested.insert(term, factory);
    }

    /// Installs a context tracker.
    pub fn set_context(&mut self, tracker: Rc<dyn ContextTracker>) {
        self.context = Some(tracker);
    }

    /// Enables exactly the named dialects.
    pub fn with_dialects(&mut self, names: &[&str]) -> Result<(), GrammarError> {
        let mut flags = vec![false; self.dialect_names.len()];
        for name in names {
            let id = self
                .dialect_names
                .iter()
                .position(|known| known.as_str() == *name)
                .ok_or_else(|| GrammarError::UnknownDialect((*name).into()))?;
            flags[id] = true;
        }
        let mut disabled = None;
        for (id, terms) in self.dialect_terms.iter().enumerate() {
            if flags[id] {
                continue;
            }
            let disabled =
                disabled.get_or_insert_with(|| vec![0u8; self.max_term as usize + 1]);
            for &term in terms {
                disabled[term as usize] = 1;
            }
        }
        // A term opted into several dialects stays available when any one
        // of them is enabled.
        if let Some(disabled) = &mut disabled {
            for (id, terms) in self.dialect_terms.iter().enumerate() {
                if !flags[id] {
                    continue;
                }
                for &term in terms {
                    disabled[term as usize] = 0;
                }
            }
        }
        self.dialect = Dialect { flags, disabled };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Table accessors
    // ------------------------------------------------------------------

    /// Reads one slot of a state record.
    #[must_use]
    pub fn state_slot(&self, state: u32, slot: u32) -> u32 {
        self.states[(state * state_slot::COUNT + slot) as usize]
    }

    /// Tests a bit of a state's flags word.
    #[must_use]
    pub fn state_flag(&self, state: u32, flag: u32) -> bool {
        self.state_slot(state, state_slot::FLAGS) & flag != 0
    }

    /// Looks up the action for `terminal` in `state`, searching the main
    /// and skip sequences. Returns 0 when no action applies.
    #[must_use]
    pub fn has_action(&self, state: u32, terminal: u16) -> u32 {
        let data = &self.data;
        for set in 0..2 {
            let slot = if set == 0 {
                state_slot::ACTIONS
            } else {
                state_slot::SKIP
            };
            let mut i = self.state_slot(state, slot) as usize;
            loop {
                let next = data[i];
                if next == seq::END {
                    if data[i + 1] == seq::NEXT {
                        i = pair(data, i + 2) as usize;
                        continue;
                    } else if data[i + 1] == seq::OTHER {
                        return pair(data, i + 2);
                    }
                    break;
                }
                if next == terminal || next == ERROR_TERM {
                    return pair(data, i + 1);
                }
                i += 3;
            }
        }
        0
    }

    /// Applies `f` to the state's default reduction (if any) and then every
    /// action in its main sequence, stopping at the first `Some`.
    pub fn all_actions<R>(&self, state: u32, mut f: impl FnMut(u32) -> Option<R>) -> Option<R> {
        let deflt = self.state_slot(state, state_slot::DEFAULT_REDUCE);
        let mut result = if deflt != 0 { f(deflt) } else { None };
        let mut i = self.state_slot(state, state_slot::ACTIONS) as usize;
        while result.is_none() {
            if self.data[i] == seq::END {
                if self.data[i + 1] == seq::NEXT {
                    i = pair(&self.data, i + 2) as usize;
                    continue;
                }
                break;
            }
            result = f(pair(&self.data, i + 1));
            i += 3;
        }
        result
    }

    /// Returns `true` if `action` is among the state's actions.
    #[must_use]
    pub fn valid_action(&self, state: u32, action: u32) -> bool {
        self.all_actions(state, |a| if a == action { Some(()) } else { None })
            .is_some()
    }

    /// Goto table lookup. With `loose`, the final group's target is
    /// returned even when `state` is not listed in it. Returns −1 when the
    /// term has no goto entries at all.
    ///
    /// Layout: word 0 holds the number of terms covered; word `1 + term`
    /// holds the offset of that term's entry list. Each entry is a group
    /// tag (`count << 1 | last`), a target state, and `count` source states.
    #[must_use]
    pub fn get_goto(&self, state: u32, term: u16, loose: bool) -> i32 {
        let table = &self.goto_table;
        if u32::from(term) >= u32::from(table[0]) {
            return -1;
        }
        let mut pos = table[term as usize + 1] as usize;
        loop {
            let group_tag = table[pos];
            let last = group_tag & 1 != 0;
            let target = i32::from(table[pos + 1]);
            pos += 2;
            if last && loose {
                return target;
            }
            let end = pos + (group_tag >> 1) as usize;
            while pos < end {
                if u32::from(table[pos]) == state {
                    return target;
                }
                pos += 1;
            }
            if last {
                return -1;
            }
        }
    }

    /// The `(term, state)` shift edges out of `state`, used as insert-
    /// recovery candidates. Duplicate target states are dropped.
    #[must_use]
    pub fn next_states(&self, state: u32) -> Vec<(u16, u32)> {
        let mut result: Vec<(u16, u32)> = Vec::new();
        let mut i = self.state_slot(state, state_slot::ACTIONS) as usize;
        loop {
            if self.data[i] == seq::END {
                if self.data[i + 1] == seq::NEXT {
                    i = pair(&self.data, i + 2) as usize;
                    continue;
                }
                break;
            }
            // Keep plain shifts only; the reduce flag lives in the high word.
            if self.data[i + 2] & ((action::REDUCE_FLAG >> 16) as u16) == 0 {
                let term = self.data[i];
                let target = u32::from(self.data[i + 1]);
                if !result.iter().any(|&(_, state)| state == target) {
                    result.push((term, target));
                }
            }
            i += 3;
        }
        result
    }

    /// The dynamic precedence configured for `term`, or 0.
    #[must_use]
    pub fn dynamic_precedence(&self, term: u16) -> i32 {
        self.dynamic_prec.get(&term).copied().unwrap_or(0)
    }

    /// Returns `true` if a token of `term` should replace an already
    /// accepted token of `prev` covering the same input.
    #[must_use]
    pub fn overrides(&self, term: u16, prev: u16) -> bool {
        let position = |t: u16| self.token_prec.iter().position(|&p| p == t);
        match position(prev) {
            None => true,
            Some(prev_at) => position(term).is_some_and(|at| at < prev_at),
        }
    }

    /// The active dialect configuration.
    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// The grammar's node types.
    #[must_use]
    pub fn node_set(&self) -> &NodeSet {
        &self.node_set
    }

    /// First repeat term id.
    #[must_use]
    pub fn min_repeat_term(&self) -> u16 {
        self.min_repeat_term
    }

    /// Highest term that produces a tree node.
    #[must_use]
    pub fn max_node(&self) -> u16 {
        self.max_node
    }

    /// Highest term id in use.
    #[must_use]
    pub fn max_term(&self) -> u16 {
        self.max_term
    }

    /// The synthetic end-of-input term.
    #[must_use]
    pub fn eof_term(&self) -> u16 {
        self.eof_term
    }

    /// The named top rule, or the spec's first one.
    #[must_use]
    pub fn top_rule(&self, name: Option<&str>) -> Option<&TopRule> {
        match name {
            Some(name) => self.top_rules.get(name),
            None => self.top_rules.first().map(|(_, rule)| rule),
        }
    }

    /// The packed action data, exposed for dead-end checks.
    #[must_use]
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    /// The tokenizer for mask bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is an unresolved external tokenizer; parser
    /// construction checks [`Self::unresolved_tokenizer`] first.
    #[must_use]
    pub fn tokenizer(&self, index: usize) -> &Rc<dyn Tokenizer> {
        match &self.tokenizers[index] {
            TokenizerSlot::Ready(tokenizer) => tokenizer,
            TokenizerSlot::Pending(name) => {
                unreachable!("tokenizer '{name}' resolved before parsing")
            }
        }
    }

    /// Number of tokenizer slots.
    #[must_use]
    pub fn tokenizer_count(&self) -> usize {
        self.tokenizers.len()
    }

    /// The nested-parse factory for `term`, if any.
    #[must_use]
    pub fn nested(&self, term: u16) -> Option<&NestedParse> {
        self.nested.get(&term)
    }

    /// Returns `true` if any nested-parse factories are registered.
    #[must_use]
    pub fn has_nested(&self) -> bool {
        !self.nested.is_empty()
    }

    /// The installed context tracker, if any.
    #[must_use]
    pub fn context(&self) -> Option<&Rc<dyn ContextTracker>> {
        self.context.as_ref()
    }
}

impl std::fmt::Debug for LrGrammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrGrammar")
            .field("states", &(self.states.len() / state_slot::COUNT as usize))
            .field("nodes", &self.node_set.len())
            .field("max_term", &self.max_term)
            .field("top_rules", &self.top_rules)
            .finish_non_exhaustive()
    }
}
