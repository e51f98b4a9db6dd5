//! The parse stack.
//!
//! A stack holds the LR state, the frame history of pushed states, and a
//! local buffer of tree records. Forked stacks share the history of their
//! common ancestor: `split` hands the new stack a reference to the frozen
//! part of this stack's buffer instead of copying it. Records past
//! `reduce_pos` (skipped tokens not yet absorbed into a reduction) are
//! copied to the fork's private buffer, so everything reachable through a
//! parent link is immutable. The single exception is error-node
//! coalescing, which may extend the end of a trailing error record.
//!
//! Parse-level failures never surface as errors here. They turn into error
//! nodes in the buffer, score penalties, and extra candidate stacks for the
//! driver to pursue.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::trace;

use sylva_tree::{
    BufferCursor, BuildParams, FlatBufferCursor, NodeType, Tree, ERROR_TERM, PROP_MOUNTED,
    SIZE_CONTEXT, SIZE_LOOKAHEAD, SIZE_PROP, SIZE_REUSED,
};

use crate::constants::{action, driver, recover, seq, state_flag, state_slot};
use crate::context::{ContextValue, StackContext};
use crate::cursor::StackBufferCursor;
use crate::grammar::LrGrammar;
use crate::input::{Gap, InputStream};

/// A nestable region recorded when a node with a nested-grammar factory
/// lands in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestCandidate {
    /// The term whose factory applies.
    pub term: u16,
    /// Start of the region.
    pub start: u32,
    /// End of the region.
    pub end: u32,
}

/// State owned by one parse and shared by all of its live stacks.
pub struct ParseShared {
    /// Prebuilt subtrees spliced into buffers via [`SIZE_REUSED`] records.
    pub(crate) reused: Vec<Rc<Tree>>,
    /// Values attached through [`SIZE_PROP`] records.
    pub(crate) prop_values: Vec<Rc<Tree>>,
    /// The input gaps of this parse.
    pub(crate) gaps: Rc<[Gap]>,
    /// The per-parse placeholder type standing in for gap content.
    pub(crate) placeholder: NodeType,
    /// Nestable subranges, keyed by stack id. Cleared when stacks retire.
    pub(crate) nest_candidates: FxHashMap<u64, NestCandidate>,
    next_stack_id: u64,
}

impl ParseShared {
    /// Creates the shared state for one parse.
    #[must_use]
    pub fn new(gaps: Rc<[Gap]>) -> Self {
        Self {
            reused: Vec::new(),
            prop_values: Vec::new(),
            gaps,
            placeholder: NodeType::placeholder(),
            nest_candidates: FxHashMap::default(),
            next_stack_id: 0,
        }
    }

    /// The shared reused-subtree table.
    #[must_use]
    pub fn reused(&self) -> &[Rc<Tree>] {
        &self.reused
    }

    /// The shared property-value table.
    #[must_use]
    pub fn prop_values(&self) -> &[Rc<Tree>] {
        &self.prop_values
    }

    fn next_id(&mut self) -> u64 {
        self.next_stack_id += 1;
        self.next_stack_id
    }
}

/// Everything a mutating stack operation needs besides the stack itself.
pub struct StackCx<'a, 'i> {
    /// The grammar tables.
    pub grammar: &'a LrGrammar,
    /// Parse-wide shared state.
    pub shared: &'a mut ParseShared,
    /// The input stream, used by context trackers and nested parses.
    pub stream: &'a mut InputStream<'i>,
}

/// A frozen view of a stack's buffer at the moment it was forked, linked
/// toward older history.
pub(crate) struct StackHistory {
    pub(crate) buffer: Rc<RefCell<Vec<i32>>>,
    pub(crate) buffer_base: u32,
    pub(crate) parent: Option<Rc<StackHistory>>,
}

/// One branch of the parse.
pub struct Stack {
    pub(crate) state: u32,
    /// Flat frame triples: state, start position, buffer base at entry.
    pub(crate) frames: Vec<u32>,
    pub(crate) pos: u32,
    pub(crate) reduce_pos: u32,
    pub(crate) score: i32,
    pub(crate) buffer: Rc<RefCell<Vec<i32>>>,
    pub(crate) buffer_base: u32,
    pub(crate) parent: Option<Rc<StackHistory>>,
    pub(crate) context: Option<StackContext>,
    pub(crate) look_ahead: u32,
    start_pos: u32,
    start_state: u32,
    id: u64,
}

impl Stack {
    /// Creates the initial stack for a parse.
    #[must_use]
    pub fn start(cx: &mut StackCx<'_, '_>, state: u32, pos: u32) -> Self {
        let context = cx
            .grammar
            .context()
            .map(|tracker| StackContext::new(Rc::clone(tracker), tracker.start()));
        Self {
            state,
            frames: Vec::new(),
            pos,
            reduce_pos: pos,
            score: 0,
            buffer: Rc::new(RefCell::new(Vec::new())),
            buffer_base: 0,
            parent: None,
            context,
            look_ahead: 0,
            start_pos: pos,
            start_state: state,
            id: cx.shared.next_id(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The current LR state.
    #[must_use]
    pub fn state(&self) -> u32 {
        self.state
    }

    /// The input position consumed so far.
    #[must_use]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// The position the next reduction nominally ends at. Trails `pos`
    /// only while shifted skip tokens are still unabsorbed.
    #[must_use]
    pub fn reduce_pos(&self) -> u32 {
        self.reduce_pos
    }

    /// Dynamic-precedence credit minus recovery penalties. Higher is better.
    #[must_use]
    pub fn score(&self) -> i32 {
        self.score
    }

    /// This stack's stable identity, assigned at construction.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len() / 3
    }

    /// Length of the local buffer, in words.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.borrow().len()
    }

    /// Absolute word offset at which the local buffer begins.
    #[must_use]
    pub fn buffer_base(&self) -> u32 {
        self.buffer_base
    }

    /// The maximum position that influenced decisions on this stack.
    #[must_use]
    pub fn look_ahead(&self) -> u32 {
        self.look_ahead
    }

    /// A copy of the local buffer, for inspection in tests and debugging.
    /// Records inherited from ancestors are only reachable through
    /// [`crate::cursor::StackBufferCursor`].
    #[must_use]
    pub fn local_buffer(&self) -> Vec<i32> {
        self.buffer.borrow().clone()
    }

    /// The current context-tracker value, if a tracker is installed.
    #[must_use]
    pub fn context_value(&self) -> Option<&ContextValue> {
        self.context.as_ref().map(StackContext::value)
    }

    /// The current context hash, or 0 without a tracker.
    #[must_use]
    pub fn context_hash(&self) -> u32 {
        self.context.as_ref().map_or(0, StackContext::hash)
    }

    /// Returns `true` if the dialect with this index is enabled.
    #[must_use]
    pub fn dialect_enabled(&self, grammar: &LrGrammar, id: usize) -> bool {
        grammar.dialect().enabled(id)
    }

    // ------------------------------------------------------------------
    // Core mutations
    // ------------------------------------------------------------------

    /// Records the current state as a frame and enters `state`.
    pub fn push_state(&mut self, state: u32, start: u32) {
        let base = self.buffer_base + self.buffer.borrow().len() as u32;
        self.frames.extend([self.state, start, base]);
        self.state = state;
    }

    /// Applies one table action: a reduction when the reduce bit is set,
    /// otherwise a shift of `next` ending at `next_end`.
    pub fn apply(&mut self, cx: &mut StackCx<'_, '_>, act: u32, next: u16, next_end: u32) {
        if act & action::REDUCE_FLAG != 0 {
            self.reduce(cx, act);
        } else {
            self.shift(cx, act, next, next_end);
        }
    }

    /// Shifts `next`, or performs the non-consuming state change a goto
    /// action encodes.
    pub fn shift(&mut self, cx: &mut StackCx<'_, '_>, act: u32, next: u16, next_end: u32) {
        if act & action::GOTO_FLAG != 0 {
            self.push_state(act & action::VALUE_MASK, self.pos);
        } else if act & action::STAY_FLAG == 0 {
            let next_state = act;
            let start = cx.stream.clip_pos(self.pos);
            if next_end > self.pos || next <= cx.grammar.max_node() {
                self.pos = next_end;
                if !cx.grammar.state_flag(next_state, state_flag::SKIPPED) {
                    self.reduce_pos = next_end;
                }
            }
            self.push_state(next_state, start);
            self.shift_context(cx, next, start);
            if next <= cx.grammar.max_node() {
                self.emit_terminal(cx, next, start, next_end);
            }
        } else {
            // Skipped token: consume input without pushing a state.
            let start = cx.stream.clip_pos(self.pos);
            self.pos = next_end;
            self.shift_context(cx, next, start);
            if next <= cx.grammar.max_node() {
                self.emit_terminal(cx, next, start, next_end);
            }
        }
    }

    /// Performs the reduction `act` encodes.
    pub fn reduce(&mut self, cx: &mut StackCx<'_, '_>, act: u32) {
        let depth = (act >> action::REDUCE_DEPTH_SHIFT) as usize;
        let term = (act & action::VALUE_MASK) as u16;
        let grammar = cx.grammar;

        let far_lookahead = self.reduce_pos + driver::LOOKAHEAD_MARGIN < self.pos;
        let lookahead_emitted = far_lookahead && self.set_look_ahead(self.pos);

        let dprec = grammar.dynamic_precedence(term);
        if dprec != 0 {
            self.score += dprec;
        }

        if depth == 0 {
            let goto = grammar.get_goto(self.state, term, true);
            debug_assert!(goto >= 0, "missing goto for term {term}");
            self.push_state(goto as u32, self.reduce_pos);
            // Zero-depth reductions add to the stack without popping.
            if term < grammar.min_repeat_term() {
                let size = if lookahead_emitted { 8 } else { 4 };
                self.store_node(cx, term, self.reduce_pos, self.reduce_pos, size, true);
            }
            self.reduce_context(cx, term, self.reduce_pos);
            return;
        }

        // A stay reduction consumes two extra frames: the dummy parent of
        // the skipped expression and the state that stays current.
        let stay = act & action::STAY_FLAG != 0;
        let base = self.frames.len() - (depth - 1) * 3 - if stay { 6 } else { 0 };
        let start = if base > 0 {
            self.frames[base - 2]
        } else {
            self.start_pos
        };
        let base_buffer = if base > 0 { self.frames[base - 1] } else { 0 };
        let covered = self.buffer_base + self.buffer.borrow().len() as u32 - base_buffer;

        if term < grammar.min_repeat_term() || act & action::REPEAT_FLAG != 0 {
            let end = if grammar.state_flag(self.state, state_flag::SKIPPED) {
                self.pos
            } else {
                self.reduce_pos
            };
            self.store_node(cx, term, start, end, covered + 4, true);
        }

        if stay {
            self.state = if base >= 3 {
                self.frames[base - 3]
            } else {
                self.start_state
            };
        } else {
            let base_state = if base >= 3 {
                self.frames[base - 3]
            } else {
                self.start_state
            };
            let goto = grammar.get_goto(base_state, term, true);
            debug_assert!(goto >= 0, "missing goto for term {term}");
            self.state = goto as u32;
        }
        // Pop through the base frame: a depth-d reduction removes exactly
        // d frames.
        self.frames.truncate(base.saturating_sub(3));
        self.reduce_context(cx, term, start);
    }

    /// Appends a `(term, start, end, size)` record, coalescing adjacent
    /// error nodes and keeping records ordered by `end` when a reduction
    /// finishes behind already-shifted skip tokens.
    pub fn store_node(
        &mut self,
        cx: &mut StackCx<'_, '_>,
        term: u16,
        start: u32,
        end: u32,
        size: u32,
        is_reduce: bool,
    ) {
        if term == ERROR_TERM && self.try_merge_error(start, end) {
            return;
        }

        {
            let mut buffer = self.buffer.borrow_mut();
            let mut size = size as i32;
            let mut index = buffer.len();
            if !is_reduce || self.pos == end {
                buffer.extend([i32::from(term), start as i32, end as i32, size]);
            } else {
                // The reduction ends before already-emitted skip tokens;
                // slide those forward and insert in order by end position.
                let mut must_move = false;
                if index > 0 && buffer[index - 4] != i32::from(ERROR_TERM) {
                    let mut scan = index;
                    while scan > 0 && buffer[scan - 2] > end as i32 {
                        if buffer[scan - 1] >= 0 {
                            must_move = true;
                            break;
                        }
                        scan -= 4;
                    }
                }
                if must_move {
                    buffer.resize(index + 4, 0);
                    while index > 0 && buffer[index - 2] > end as i32 {
                        buffer[index] = buffer[index - 4];
                        buffer[index + 1] = buffer[index - 3];
                        buffer[index + 2] = buffer[index - 2];
                        buffer[index + 3] = buffer[index - 1];
                        index -= 4;
                        // Moved records fall outside the new node.
                        if size > 4 {
                            size -= 4;
                        }
                    }
                    buffer[index] = i32::from(term);
                    buffer[index + 1] = start as i32;
                    buffer[index + 2] = end as i32;
                    buffer[index + 3] = size;
                } else {
                    buffer.extend([i32::from(term), start as i32, end as i32, size]);
                }
            }
        }
        self.check_nesting(cx, term, start, end);
    }

    /// Error-node coalescing: when the most recent record (possibly in the
    /// direct ancestor, if the local buffer is empty) is an error node,
    /// zero-width additions are dropped and overlapping ones extend it.
    fn try_merge_error(&mut self, start: u32, end: u32) -> bool {
        // Only when no frame was pushed since the last record.
        let local_len = self.buffer.borrow().len();
        if let Some(&frame_base) = self.frames.last() {
            if frame_base >= self.buffer_base + local_len as u32 {
                return false;
            }
        }
        let (buffer, top) = if local_len == 0 {
            match &self.parent {
                Some(parent) => (
                    Rc::clone(&parent.buffer),
                    (self.buffer_base - parent.buffer_base) as usize,
                ),
                None => return false,
            }
        } else {
            (Rc::clone(&self.buffer), local_len)
        };
        if top == 0 {
            return false;
        }
        let mut buffer = buffer.borrow_mut();
        if buffer[top - 4] == i32::from(ERROR_TERM) && buffer[top - 1] > -1 {
            if start == end {
                return true;
            }
            if buffer[top - 2] >= start as i32 {
                buffer[top - 2] = end as i32;
                return true;
            }
        }
        false
    }

    /// Emits a terminal record, preceded by placeholder subtrees for any
    /// gaps the token spans; each placeholder inflates the record's size.
    fn emit_terminal(&mut self, cx: &mut StackCx<'_, '_>, term: u16, start: u32, end: u32) {
        let mut extra = 0u32;
        let gaps = Rc::clone(&cx.shared.gaps);
        {
            let mut buffer = self.buffer.borrow_mut();
            for gap in gaps.iter() {
                if gap.from >= start && gap.to <= end {
                    let index = cx.shared.reused.len();
                    cx.shared.reused.push(Rc::new(Tree::leaf(
                        cx.shared.placeholder.clone(),
                        gap.to - gap.from,
                    )));
                    buffer.extend([index as i32, gap.from as i32, gap.to as i32, SIZE_REUSED]);
                    extra += 4;
                }
            }
            buffer.extend([
                i32::from(term),
                start as i32,
                end as i32,
                (4 + extra) as i32,
            ]);
        }
        self.check_nesting(cx, term, start, end);
    }

    fn check_nesting(&self, cx: &mut StackCx<'_, '_>, term: u16, start: u32, end: u32) {
        if cx.grammar.nested(term).is_some() {
            cx.shared
                .nest_candidates
                .insert(self.id, NestCandidate { term, start, end });
        }
    }

    // ------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------

    /// Forks this stack. The shared prefix of the buffer is handed to the
    /// fork by reference; records past `reduce_pos` are copied into the
    /// fork's private buffer so the shared part stays frozen. Cheap, since
    /// frames are typically shallow.
    #[must_use]
    pub fn split(&self, shared: &mut ParseShared) -> Stack {
        let buffer = self.buffer.borrow();
        let mut off = buffer.len();
        while off > 0 && buffer[off - 2] > self.reduce_pos as i32 {
            off -= 4;
        }
        let tail = buffer[off..].to_vec();
        drop(buffer);
        let base = self.buffer_base + off as u32;

        let mut parent = Some(Rc::new(StackHistory {
            buffer: Rc::clone(&self.buffer),
            buffer_base: self.buffer_base,
            parent: self.parent.clone(),
        }));
        // Skip ancestors that contribute no records of their own.
        while parent
            .as_ref()
            .is_some_and(|history| history.buffer_base == base)
        {
            parent = parent.and_then(|history| history.parent.clone());
        }

        let id = shared.next_id();
        trace!(from = self.id, to = id, "stack split");
        Stack {
            state: self.state,
            frames: self.frames.clone(),
            pos: self.pos,
            reduce_pos: self.reduce_pos,
            score: self.score,
            buffer: Rc::new(RefCell::new(tail)),
            buffer_base: base,
            parent,
            context: self.context.clone(),
            look_ahead: self.look_ahead,
            start_pos: self.start_pos,
            start_state: self.start_state,
            id,
        }
    }

    // ------------------------------------------------------------------
    // Lookahead queries
    // ------------------------------------------------------------------

    /// Returns `true` if some sequence of default reductions followed by an
    /// explicit shift of `term` exists from the current state. Never
    /// mutates the stack.
    #[must_use]
    pub fn can_shift(&self, grammar: &LrGrammar, term: u16) -> bool {
        let mut sim = SimulatedStack::new(self);
        loop {
            let deflt = grammar.state_slot(sim.state, state_slot::DEFAULT_REDUCE);
            let act = if deflt != 0 {
                deflt
            } else {
                grammar.has_action(sim.state, term)
            };
            if act == 0 {
                return false;
            }
            if act & action::REDUCE_FLAG == 0 {
                return true;
            }
            sim.reduce(grammar, act);
        }
    }

    /// Walks the forced-reduction chain upward; returns the start of the
    /// topmost pending reduction producing one of `terms` that begins
    /// before `before`.
    #[must_use]
    pub fn start_of(&self, grammar: &LrGrammar, terms: &[u16], before: Option<u32>) -> Option<u32> {
        self.walk_forced(grammar, |term, start| {
            if terms.contains(&term) && before.map_or(true, |limit| start < limit) {
                Some(start)
            } else {
                None
            }
        })
    }

    /// Like [`Self::start_of`], but returns the earliest position at which
    /// a pending reduction producing one of `terms` begins. Used to decide
    /// whether a nested parse is worth attempting.
    #[must_use]
    pub fn may_nest_from(&self, grammar: &LrGrammar, terms: &[u16]) -> Option<u32> {
        let mut earliest: Option<u32> = None;
        let _ = self.walk_forced(grammar, |term, start| {
            if terms.contains(&term) {
                earliest = Some(earliest.map_or(start, |seen| seen.min(start)));
            }
            None::<()>
        });
        earliest
    }

    fn walk_forced<R>(
        &self,
        grammar: &LrGrammar,
        mut f: impl FnMut(u16, u32) -> Option<R>,
    ) -> Option<R> {
        let mut sim = SimulatedStack::new(self);
        let mut seen: Vec<(u32, usize)> = Vec::new();
        loop {
            let force = grammar.state_slot(sim.state, state_slot::FORCED_REDUCE);
            if force & action::REDUCE_FLAG == 0 {
                return None;
            }
            if seen.contains(&(sim.state, sim.base)) {
                return None;
            }
            seen.push((sim.state, sim.base));

            let depth = (force >> action::REDUCE_DEPTH_SHIFT) as usize;
            let term = (force & action::VALUE_MASK) as u16;
            if depth > 0 {
                if sim.base + 3 < depth * 3 {
                    return None;
                }
                let base = sim.base - (depth - 1) * 3;
                let start = if base >= 3 {
                    sim.frames()[base - 2]
                } else {
                    self.start_pos
                };
                if let Some(result) = f(term, start) {
                    return Some(result);
                }
            }
            sim.reduce(grammar, force);
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Forks up to [`recover::MAX_NEXT`] stacks that insert a zero-width
    /// error node and enter a neighboring state, preferring states that can
    /// act on `next`.
    #[must_use]
    pub fn recover_by_insert(&self, cx: &mut StackCx<'_, '_>, next: u16) -> Vec<Stack> {
        if self.frames.len() >= recover::MAX_INSERT_STACK_DEPTH {
            return Vec::new();
        }
        let mut candidates = cx.grammar.next_states(self.state);
        if candidates.len() > recover::MAX_NEXT
            || self.frames.len() >= recover::DAMPEN_INSERT_STACK_DEPTH
        {
            let mut best: Vec<(u16, u32)> = Vec::new();
            for &(term, state) in &candidates {
                if state != self.state && cx.grammar.has_action(state, next) != 0 {
                    best.push((term, state));
                }
            }
            if self.frames.len() < recover::DAMPEN_INSERT_STACK_DEPTH {
                for &(term, state) in &candidates {
                    if best.len() >= recover::MAX_NEXT {
                        break;
                    }
                    if !best.iter().any(|&(_, seen)| seen == state) {
                        best.push((term, state));
                    }
                }
            }
            candidates = best;
        }
        let mut result = Vec::new();
        for &(term, state) in &candidates {
            if result.len() >= recover::MAX_NEXT {
                break;
            }
            if state == self.state {
                continue;
            }
            let mut stack = self.split(cx.shared);
            stack.push_state(state, self.pos);
            stack.store_node(cx, ERROR_TERM, stack.pos, stack.pos, 4, true);
            stack.shift_context(cx, term, self.pos);
            stack.reduce_pos = self.pos;
            stack.score -= recover::INSERT;
            trace!(stack = stack.id, state, "recover by insert");
            result.push(stack);
        }
        result
    }

    /// Recovers by skipping the next token: the token itself (when it is a
    /// node term) plus an error node covering it land in the buffer.
    pub fn recover_by_delete(&mut self, cx: &mut StackCx<'_, '_>, next: u16, next_end: u32) {
        let is_node = next <= cx.grammar.max_node();
        if is_node {
            self.store_node(cx, next, self.pos, next_end, 4, false);
        }
        self.store_node(
            cx,
            ERROR_TERM,
            self.pos,
            next_end,
            if is_node { 8 } else { 4 },
            false,
        );
        self.pos = next_end;
        self.reduce_pos = next_end;
        self.score -= recover::DELETE;
    }

    /// Takes the state's forced reduction, emitting an error node first
    /// when the action is not currently valid. Returns whether a reduction
    /// was applied.
    pub fn force_reduce(&mut self, cx: &mut StackCx<'_, '_>) -> bool {
        let grammar = cx.grammar;
        let mut reduce = grammar.state_slot(self.state, state_slot::FORCED_REDUCE);
        if reduce & action::REDUCE_FLAG == 0 {
            return false;
        }
        if !grammar.valid_action(self.state, reduce) {
            let depth = (reduce >> action::REDUCE_DEPTH_SHIFT) as usize;
            let term = (reduce & action::VALUE_MASK) as u16;
            // The goto source sits one frame below the reduced region, or
            // is the start state when the reduction empties the stack.
            let target = self.frames.len() as i64 - (depth * 3) as i64;
            let goto_valid = depth > 0 && target >= -3 && {
                let source = if target >= 0 {
                    self.frames[target as usize]
                } else {
                    self.start_state
                };
                grammar.get_goto(source, term, false) >= 0
            };
            if !goto_valid {
                match self.find_forced_reduction(grammar) {
                    Some(backup) => reduce = backup,
                    None => return false,
                }
            }
            self.store_node(cx, ERROR_TERM, self.pos, self.pos, 4, true);
            self.score -= recover::REDUCE;
        }
        self.reduce_pos = self.pos;
        self.reduce(cx, reduce);
        true
    }

    /// Scans states reachable through reductions for one whose reduction
    /// takes the stack to a frame with a valid goto, used when the forced
    /// reduction itself leads nowhere.
    fn find_forced_reduction(&self, grammar: &LrGrammar) -> Option<u32> {
        let mut seen = Vec::new();
        self.explore_forced(grammar, self.state, 0, &mut seen)
    }

    fn explore_forced(
        &self,
        grammar: &LrGrammar,
        state: u32,
        depth: u32,
        seen: &mut Vec<u32>,
    ) -> Option<u32> {
        if seen.contains(&state) {
            return None;
        }
        seen.push(state);
        grammar.all_actions(state, |act| {
            if act & (action::STAY_FLAG | action::GOTO_FLAG) != 0 {
                return None;
            }
            if act & action::REDUCE_FLAG != 0 {
                let r_depth = (act >> action::REDUCE_DEPTH_SHIFT) as i64 - i64::from(depth);
                if r_depth > 1 {
                    let term = act & action::VALUE_MASK;
                    let target = self.frames.len() as i64 - r_depth * 3;
                    if target >= -3 {
                        let source = if target >= 0 {
                            self.frames[target as usize]
                        } else {
                            self.start_state
                        };
                        if grammar.get_goto(source, term as u16, false) >= 0 {
                            return Some(
                                ((r_depth as u32) << action::REDUCE_DEPTH_SHIFT)
                                    | action::REDUCE_FLAG
                                    | term,
                            );
                        }
                    }
                }
                None
            } else {
                self.explore_forced(grammar, act, depth + 1, seen)
            }
        })
    }

    /// Forces reductions until the state accepts. Idempotent on an
    /// accepting stack.
    pub fn force_all(&mut self, cx: &mut StackCx<'_, '_>) {
        while !cx.grammar.state_flag(self.state, state_flag::ACCEPTING) {
            if !self.force_reduce(cx) {
                self.store_node(cx, ERROR_TERM, self.pos, self.pos, 4, true);
                break;
            }
        }
    }

    /// Returns `true` only when the stack is at its initial depth and the
    /// current state offers no actions at all.
    #[must_use]
    pub fn dead_end(&self, grammar: &LrGrammar) -> bool {
        if self.frames.len() != 3 {
            return false;
        }
        grammar.data()[grammar.state_slot(self.state, state_slot::ACTIONS) as usize] == seq::END
            && grammar.state_slot(self.state, state_slot::DEFAULT_REDUCE) == 0
    }

    /// Drops all progress and restarts from the bottom state, leaving an
    /// error node behind.
    pub fn restart(&mut self, cx: &mut StackCx<'_, '_>) {
        self.store_node(cx, ERROR_TERM, self.pos, self.pos, 4, true);
        self.state = self.start_state;
        self.frames.clear();
    }

    /// Returns `true` if both stacks sit in the same state with the same
    /// frame states.
    #[must_use]
    pub fn same_state(&self, other: &Stack) -> bool {
        if self.state != other.state || self.frames.len() != other.frames.len() {
            return false;
        }
        self.frames
            .iter()
            .zip(&other.frames)
            .step_by(3)
            .all(|(a, b)| a == b)
    }

    // ------------------------------------------------------------------
    // Reuse primitives
    // ------------------------------------------------------------------

    /// Splices a prebuilt subtree at the current position and enters
    /// `next_state`.
    pub fn use_node(&mut self, cx: &mut StackCx<'_, '_>, tree: Rc<Tree>, next_state: u32) {
        let index = match cx.shared.reused.last() {
            Some(last) if Rc::ptr_eq(last, &tree) => cx.shared.reused.len() - 1,
            _ => {
                cx.shared.reused.push(Rc::clone(&tree));
                cx.shared.reused.len() - 1
            }
        };
        let start = self.pos;
        let len = u32::from(tree.len());
        self.pos = start + len;
        self.reduce_pos = self.pos;
        self.push_state(next_state, start);
        self.buffer.borrow_mut().extend([
            index as i32,
            start as i32,
            self.pos as i32,
            SIZE_REUSED,
        ]);
        if let Some(context) = &self.context {
            let tracker = Rc::clone(&context.tracker);
            let value = tracker.reuse(
                &Rc::clone(&context.context),
                &tree,
                self.state,
                cx.stream.reset(self.pos, None),
            );
            self.update_context(value);
        }
    }

    /// Converts the top buffer record and its covered descendants into an
    /// entry of the reused table, rerooting the stack when the covered
    /// region reaches into ancestor buffers. Returns whether a node was
    /// materialized.
    pub fn materialize_top_node(&mut self, cx: &mut StackCx<'_, '_>) -> bool {
        let total = self.buffer_base as usize + self.buffer.borrow().len();
        let (term, start, end, window) = {
            let cursor = StackBufferCursor::create(self, total);
            if cursor.pos() == 0 || cursor.size() < 4 {
                return false;
            }
            (
                cursor.id() as u16,
                cursor.start() as u32,
                cursor.end() as u32,
                cursor.size() as usize,
            )
        };
        let cut = total - window;

        // Copy the node's children (everything below the record itself)
        // into a flat slice and run the tree builder over it.
        let mut slice = vec![0i32; window - 4];
        {
            let mut cursor = StackBufferCursor::create(self, total);
            cursor.next();
            let mut at = slice.len();
            while cursor.pos() > cut {
                at -= 4;
                slice[at] = cursor.id();
                slice[at + 1] = cursor.start();
                slice[at + 2] = cursor.end();
                slice[at + 3] = cursor.size();
                cursor.next();
            }
        }
        let tree = Tree::build(
            FlatBufferCursor::new(&slice),
            &BuildParams {
                node_set: cx.grammar.node_set(),
                top: term,
                start,
                length: end - start,
                reused: &cx.shared.reused,
                prop_values: &cx.shared.prop_values,
                min_repeat_term: cx.grammar.min_repeat_term(),
            },
        );

        if cut >= self.buffer_base as usize {
            let keep = cut - self.buffer_base as usize;
            self.buffer.borrow_mut().truncate(keep);
        } else {
            // Reroot past the consumed region: adopt the un-consumed prefix
            // of the ancestor the cut lands in as our own.
            let mut node = self.parent.clone();
            while let Some(history) = node {
                if (history.buffer_base as usize) <= cut {
                    let local = history.buffer.borrow()[..cut - history.buffer_base as usize]
                        .to_vec();
                    self.buffer = Rc::new(RefCell::new(local));
                    self.buffer_base = history.buffer_base;
                    self.parent = history.parent.clone();
                    break;
                }
                node = history.parent.clone();
            }
        }

        let tree = Rc::new(tree);
        let index = match cx.shared.reused.last() {
            Some(last) if Rc::ptr_eq(last, &tree) => cx.shared.reused.len() - 1,
            _ => {
                cx.shared.reused.push(tree);
                cx.shared.reused.len() - 1
            }
        };
        self.buffer
            .borrow_mut()
            .extend([index as i32, start as i32, end as i32, SIZE_REUSED]);
        true
    }

    /// Attaches a mounted tree to the current node through a property
    /// record.
    pub fn mount(&mut self, cx: &mut StackCx<'_, '_>, tree: Rc<Tree>) {
        let index = cx.shared.prop_values.len();
        cx.shared.prop_values.push(tree);
        self.buffer.borrow_mut().extend([
            index as i32,
            self.reduce_pos as i32,
            i32::from(PROP_MOUNTED),
            SIZE_PROP,
        ]);
    }

    /// Flushes the final context and lookahead markers so incremental
    /// reuse can invalidate correctly.
    pub fn close(&mut self) {
        if let Some(context) = &self.context {
            if context.tracker.strict() {
                self.emit_context_marker();
            }
        }
        if self.look_ahead > 0 {
            self.emit_look_ahead();
        }
    }

    // ------------------------------------------------------------------
    // Context and lookahead plumbing
    // ------------------------------------------------------------------

    fn shift_context(&mut self, cx: &mut StackCx<'_, '_>, term: u16, start: u32) {
        if let Some(context) = &self.context {
            let tracker = Rc::clone(&context.tracker);
            let value = tracker.shift(
                &Rc::clone(&context.context),
                term,
                self.state,
                cx.stream.reset(start, None),
            );
            self.update_context(value);
        }
    }

    fn reduce_context(&mut self, cx: &mut StackCx<'_, '_>, term: u16, start: u32) {
        if let Some(context) = &self.context {
            let tracker = Rc::clone(&context.tracker);
            let value = tracker.reduce(
                &Rc::clone(&context.context),
                term,
                self.state,
                cx.stream.reset(start, None),
            );
            self.update_context(value);
        }
    }

    fn update_context(&mut self, value: ContextValue) {
        let Some(current) = &self.context else {
            return;
        };
        if Rc::ptr_eq(&value, &current.context) {
            return;
        }
        let next = StackContext::new(Rc::clone(&current.tracker), value);
        if next.hash != current.hash {
            self.emit_context_marker();
        }
        self.context = Some(next);
    }

    fn emit_context_marker(&mut self) {
        let hash = self.context_hash();
        let mut buffer = self.buffer.borrow_mut();
        if buffer.last() != Some(&SIZE_CONTEXT) {
            buffer.extend([
                hash as i32,
                self.reduce_pos as i32,
                self.reduce_pos as i32,
                SIZE_CONTEXT,
            ]);
        }
    }

    /// Raises the recorded lookahead, emitting a marker for the old value.
    /// Returns whether a marker was written.
    pub(crate) fn set_look_ahead(&mut self, look_ahead: u32) -> bool {
        if look_ahead <= self.look_ahead {
            return false;
        }
        let emitted = self.emit_look_ahead();
        self.look_ahead = look_ahead;
        emitted
    }

    fn emit_look_ahead(&mut self) -> bool {
        let mut buffer = self.buffer.borrow_mut();
        if buffer.last() == Some(&SIZE_LOOKAHEAD) {
            return false;
        }
        buffer.extend([
            self.look_ahead as i32,
            self.reduce_pos as i32,
            self.reduce_pos as i32,
            SIZE_LOOKAHEAD,
        ]);
        true
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pos", &self.pos)
            .field("reduce_pos", &self.reduce_pos)
            .field("score", &self.score)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

/// A lightweight mirror of a stack used to scan reductions without
/// mutating it. The frames are shared until a zero-depth reduction has to
/// push, at which point they are copied.
pub struct SimulatedStack<'a> {
    /// The simulated current state.
    pub state: u32,
    frames: Cow<'a, [u32]>,
    /// Logical top of the simulated frame array.
    pub base: usize,
    start_state: u32,
}

impl<'a> SimulatedStack<'a> {
    /// Mirrors `stack` without copying its frames.
    #[must_use]
    pub fn new(stack: &'a Stack) -> Self {
        Self {
            state: stack.state,
            frames: Cow::Borrowed(&stack.frames),
            base: stack.frames.len(),
            start_state: stack.start_state,
        }
    }

    /// The (possibly extended) frame words.
    #[must_use]
    pub fn frames(&self) -> &[u32] {
        &self.frames
    }

    /// Mirrors the arithmetic of a real reduction without writing back.
    /// Zero-depth reductions copy the frames on first write; deeper ones
    /// move `base` back through the base frame, falling back to the start
    /// state once the simulated stack empties.
    pub fn reduce(&mut self, grammar: &LrGrammar, act: u32) {
        let term = (act & action::VALUE_MASK) as u16;
        let depth = (act >> action::REDUCE_DEPTH_SHIFT) as usize;
        let source = if depth == 0 {
            let state = self.state;
            self.frames.to_mut().extend([state, 0, 0]);
            self.base += 3;
            self.frames[self.base - 3]
        } else {
            self.base -= (depth - 1) * 3;
            let source = if self.base >= 3 {
                self.frames[self.base - 3]
            } else {
                self.start_state
            };
            self.base = self.base.saturating_sub(3);
            source
        };
        let goto = grammar.get_goto(source, term, true);
        debug_assert!(goto >= 0, "missing goto for term {term}");
        self.state = goto as u32;
    }
}
