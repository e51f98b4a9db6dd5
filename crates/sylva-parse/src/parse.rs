//! The parse driver.
//!
//! A [`ParseSession`] advances the set of live stacks in lock step: each
//! round it picks the stacks at the lowest position, reads a token for
//! them, applies the resulting actions (splitting on conflicts), and prunes
//! the survivors. When every stack is stuck it switches into recovery,
//! producing forked stacks that insert, delete, or force-reduce their way
//! past the problem. Parsing ends when a stack reaches an accepting state
//! at the end of the input; its buffer becomes the tree.

use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, trace};

use sylva_tree::{BuildParams, Tree, ERROR_TERM};

use crate::constants::{driver, pair, seq, state_flag, state_slot};
use crate::cursor::StackBufferCursor;
use crate::grammar::{GrammarError, LrGrammar};
use crate::input::{Gap, Input, InputStream, Token};
use crate::stack::{ParseShared, Stack, StackCx};

/// Errors a parse can report: a syntax error in strict mode, or a
/// misconfigured request (an unknown top rule, an unresolved tokenizer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A strict parse hit a token no stack could act on.
    #[error("syntax error at {pos}")]
    Syntax {
        /// Position of the offending token.
        pos: u32,
    },

    /// The parse could not be set up with the given options.
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

/// Options for one parse.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Input intervals to skip (sorted, disjoint).
    pub gaps: Vec<Gap>,
    /// Top rule to start from; defaults to the grammar's first.
    pub top: Option<String>,
    /// Fail on the first parse error instead of recovering.
    pub strict: bool,
}

#[derive(Debug, Clone, Copy)]
struct CachedToken {
    token: Token,
    mask: u32,
    context: u32,
}

impl Default for CachedToken {
    fn default() -> Self {
        Self {
            token: Token {
                start: u32::MAX,
                end: u32::MAX,
                value: Token::NONE,
                look_ahead: 0,
            },
            mask: 0,
            context: 0,
        }
    }
}

/// Per-position token state: one cached token per tokenizer, plus the
/// action list assembled for the current stack.
struct TokenCache {
    tokens: Vec<CachedToken>,
    main: Option<Token>,
    actions: Vec<(u32, u16, u32)>,
}

impl TokenCache {
    fn new(count: usize) -> Self {
        Self {
            tokens: vec![CachedToken::default(); count],
            main: None,
            actions: Vec::new(),
        }
    }

    /// Collects the `(action, term, end)` triples applicable to `stack` at
    /// its current position, running tokenizers as needed.
    fn get_actions(
        &mut self,
        stack: &mut Stack,
        grammar: &LrGrammar,
        stream: &mut InputStream<'_>,
    ) -> usize {
        let mut action_index = 0;
        let mut main: Option<Token> = None;
        let mask = grammar.state_slot(stack.state(), state_slot::TOKENIZER_MASK);
        let context = stack.context_hash();
        let mut look_ahead = 0u32;

        for i in 0..grammar.tokenizer_count() {
            if mask & (1 << i) == 0 {
                continue;
            }
            let tokenizer = Rc::clone(grammar.tokenizer(i));
            if main.is_some() && !tokenizer.fallback() {
                continue;
            }
            let cached = self.tokens[i];
            if tokenizer.contextual()
                || cached.token.start != stack.pos()
                || cached.mask != mask
                || cached.context != context
            {
                let start = stream.clip_pos(stack.pos());
                tokenizer.token(stream.reset(start, Some(Token::none_at(start))), stack, grammar);
                let mut token = *stream.token();
                token.start = start;
                if token.value < 0 {
                    // Nothing recognized: a one-unit error token.
                    token.value = i32::from(ERROR_TERM);
                    token.end = stream.clip_pos(start + 1).min(stream.end());
                }
                self.tokens[i] = CachedToken {
                    token,
                    mask,
                    context,
                };
            }
            let token = self.tokens[i].token;
            if token.look_ahead > token.end + driver::LOOKAHEAD_MARGIN {
                look_ahead = look_ahead.max(token.look_ahead);
            }
            if token.value > i32::from(ERROR_TERM) {
                let start_index = action_index;
                action_index =
                    self.add_actions(grammar, stack.state(), token.value as u16, token.end, action_index);
                if !tokenizer.extend() {
                    main = Some(token);
                    if action_index > start_index {
                        break;
                    }
                }
            }
        }
        if look_ahead > 0 {
            stack.set_look_ahead(look_ahead);
        }
        if main.is_none() && stack.pos() == stream.end() {
            let mut eof = Token::none_at(stack.pos());
            eof.value = i32::from(grammar.eof_term());
            action_index =
                self.add_actions(grammar, stack.state(), grammar.eof_term(), eof.end, action_index);
            main = Some(eof);
        }
        self.actions.truncate(action_index);
        self.main = main;
        action_index
    }

    /// The token to report for a stuck stack.
    fn main_token(&self, stack: &Stack, grammar: &LrGrammar, stream: &InputStream<'_>) -> (u16, u32) {
        if let Some(main) = self.main {
            return (main.value.max(0) as u16, main.end);
        }
        let pos = stack.pos();
        if pos == stream.end() {
            (grammar.eof_term(), pos)
        } else {
            (ERROR_TERM, (pos + 1).min(stream.end()))
        }
    }

    fn add_actions(
        &mut self,
        grammar: &LrGrammar,
        state: u32,
        term: u16,
        end: u32,
        mut index: usize,
    ) -> usize {
        let data = grammar.data();
        for set in 0..2 {
            let slot = if set == 0 {
                state_slot::ACTIONS
            } else {
                state_slot::SKIP
            };
            let mut i = grammar.state_slot(state, slot) as usize;
            loop {
                if data[i] == seq::END {
                    if data[i + 1] == seq::NEXT {
                        i = pair(data, i + 2) as usize;
                        continue;
                    }
                    break;
                }
                if data[i] == term {
                    index = self.put_action(pair(data, i + 1), term, end, index);
                }
                i += 3;
            }
        }
        index
    }

    fn put_action(&mut self, action: u32, term: u16, end: u32, index: usize) -> usize {
        for &(seen, _, _) in &self.actions[..index] {
            if seen == action {
                return index;
            }
        }
        if self.actions.len() == index {
            self.actions.push((action, term, end));
        } else {
            self.actions[index] = (action, term, end);
        }
        index + 1
    }
}

/// One in-flight parse over a borrowed input.
pub struct ParseSession<'i> {
    grammar: Rc<LrGrammar>,
    stream: InputStream<'i>,
    tokens: TokenCache,
    stacks: Vec<Stack>,
    shared: ParseShared,
    recovering: u32,
    min_stack_pos: u32,
    start_pos: u32,
    top_term: u16,
    strict: bool,
}

impl<'i> ParseSession<'i> {
    /// Starts a parse of `input`.
    pub fn new(
        grammar: Rc<LrGrammar>,
        input: &'i dyn Input,
        options: ParseOptions,
    ) -> Result<Self, GrammarError> {
        if let Some(name) = grammar.unresolved_tokenizer() {
            return Err(GrammarError::UnresolvedTokenizer(name.clone()));
        }
        let top = *grammar.top_rule(options.top.as_deref()).ok_or_else(|| {
            GrammarError::BadTopRule(options.top.clone().unwrap_or_default().into())
        })?;
        let gaps: Rc<[Gap]> = options.gaps.into();
        let mut stream = InputStream::new(input, Rc::clone(&gaps));
        let mut shared = ParseShared::new(gaps);
        let start_pos = stream.pos();
        let stack = {
            let mut cx = StackCx {
                grammar: &grammar,
                shared: &mut shared,
                stream: &mut stream,
            };
            Stack::start(&mut cx, top.state, start_pos)
        };
        let tokens = TokenCache::new(grammar.tokenizer_count());
        Ok(Self {
            grammar,
            stream,
            tokens,
            stacks: vec![stack],
            shared,
            recovering: 0,
            min_stack_pos: start_pos,
            start_pos,
            top_term: top.term,
            strict: options.strict,
        })
    }

    /// Performs one round of work. Returns the finished tree once a stack
    /// accepts, or a [`ParseError`] in strict mode.
    pub fn advance(&mut self) -> Result<Option<Tree>, ParseError> {
        let grammar = Rc::clone(&self.grammar);
        let pos = self.min_stack_pos;
        let mut queue: VecDeque<Stack> = std::mem::take(&mut self.stacks).into();
        let mut new_stacks: Vec<Stack> = Vec::new();
        let mut stopped: Vec<Stack> = Vec::new();
        let mut stopped_tokens: Vec<(u16, u32)> = Vec::new();

        while let Some(mut stack) = queue.pop_front() {
            loop {
                self.tokens.main = None;
                if stack.pos() > pos {
                    new_stacks.push(stack);
                    break;
                }
                if self.advance_stack(&grammar, &mut stack, Some((&mut new_stacks, &mut queue))) {
                    self.check_nest(&grammar, &mut stack);
                    continue;
                }
                let token = self.tokens.main_token(&stack, &grammar, &self.stream);
                trace!(stack = stack.id(), pos = stack.pos(), "stack stuck");
                stopped.push(stack);
                stopped_tokens.push(token);
                break;
            }
        }

        if new_stacks.is_empty() {
            if let Some(finished) = self.find_finished(&grammar, &mut stopped) {
                return Ok(Some(self.stack_to_tree(&grammar, finished)));
            }
            if self.strict {
                return Err(ParseError::Syntax { pos });
            }
            if self.recovering == 0 {
                debug!(pos, "entering recovery");
                self.recovering = driver::RECOVER_DISTANCE;
            }
        }

        if self.recovering > 0 && !stopped.is_empty() {
            if let Some(mut finished) =
                self.run_recovery(&grammar, stopped, &stopped_tokens, &mut new_stacks)
            {
                debug!(score = finished.score(), "recovery finished parse");
                let mut cx = StackCx {
                    grammar: &grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                finished.force_all(&mut cx);
                return Ok(Some(self.stack_to_tree(&grammar, finished)));
            }
        }

        if self.recovering > 0 {
            let max_remaining = if self.recovering == 1 {
                1
            } else {
                self.recovering as usize * driver::MAX_REMAINING_PER_STEP
            };
            if new_stacks.len() > max_remaining {
                new_stacks.sort_by(|a, b| b.score().cmp(&a.score()));
                while new_stacks.len() > max_remaining {
                    new_stacks.pop();
                }
            }
            if new_stacks.iter().any(|stack| stack.reduce_pos() > pos) {
                self.recovering -= 1;
            }
        } else if new_stacks.len() > 1 {
            // Prune stacks in the same state, or that have run without
            // splitting for a long time.
            let mut i = 0;
            while i + 1 < new_stacks.len() {
                let mut removed_first = false;
                let mut j = i + 1;
                while j < new_stacks.len() {
                    let keep_first = {
                        let (a, b) = (&new_stacks[i], &new_stacks[j]);
                        if !a.same_state(b)
                            && (a.buffer_len() <= driver::MIN_BUFFER_LENGTH_PRUNE
                                || b.buffer_len() <= driver::MIN_BUFFER_LENGTH_PRUNE)
                        {
                            None
                        } else {
                            Some((a.score(), a.buffer_len()) > (b.score(), b.buffer_len()))
                        }
                    };
                    match keep_first {
                        None => j += 1,
                        Some(true) => {
                            new_stacks.remove(j);
                        }
                        Some(false) => {
                            new_stacks.remove(i);
                            removed_first = true;
                            break;
                        }
                    }
                }
                if !removed_first {
                    i += 1;
                }
            }
            if new_stacks.len() > driver::MAX_STACK_COUNT {
                new_stacks.truncate(driver::MAX_STACK_COUNT);
            }
        }

        self.min_stack_pos = new_stacks.iter().map(Stack::pos).min().unwrap_or(pos);
        self.stacks = new_stacks;
        let live: FxHashSet<u64> = self.stacks.iter().map(Stack::id).collect();
        self.shared.nest_candidates.retain(|id, _| live.contains(id));
        Ok(None)
    }

    /// Runs the parse to completion.
    pub fn run(&mut self) -> Result<Tree, ParseError> {
        loop {
            if self.stacks.is_empty() {
                // Nothing left to advance; report an empty error tree.
                let grammar = Rc::clone(&self.grammar);
                return Ok(Tree::build(
                    sylva_tree::FlatBufferCursor::new(&[]),
                    &self.build_params(&grammar, 0),
                ));
            }
            if let Some(tree) = self.advance()? {
                return Ok(tree);
            }
        }
    }

    /// Applies one step of work to `stack`. With `split_to`, conflicting
    /// actions fork the stack; without it only the first action applies.
    /// Returns whether the stack made progress.
    fn advance_stack(
        &mut self,
        grammar: &LrGrammar,
        stack: &mut Stack,
        mut split_to: Option<(&mut Vec<Stack>, &mut VecDeque<Stack>)>,
    ) -> bool {
        let start = stack.pos();

        let default_reduce = grammar.state_slot(stack.state(), state_slot::DEFAULT_REDUCE);
        if default_reduce > 0 {
            let mut cx = StackCx {
                grammar,
                shared: &mut self.shared,
                stream: &mut self.stream,
            };
            stack.reduce(&mut cx, default_reduce);
            return true;
        }

        if stack.depth() * 3 >= driver::CUT_DEPTH {
            // Trim a runaway stack so recovery stays bounded.
            while stack.depth() * 3 > driver::CUT_TO {
                let mut cx = StackCx {
                    grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                if !stack.force_reduce(&mut cx) {
                    break;
                }
            }
        }

        let count = self.tokens.get_actions(stack, grammar, &mut self.stream);
        let actions: Vec<(u32, u16, u32)> = self.tokens.actions[..count].to_vec();
        for (i, &(action, term, end)) in actions.iter().enumerate() {
            let last = i + 1 == actions.len() || split_to.is_none();
            if last {
                let mut cx = StackCx {
                    grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                stack.apply(&mut cx, action, term, end);
                return true;
            }
            let mut fork = stack.split(&mut self.shared);
            {
                let mut cx = StackCx {
                    grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                fork.apply(&mut cx, action, term, end);
            }
            if let Some((new_stacks, queue)) = split_to.as_mut() {
                if fork.pos() > start {
                    new_stacks.push(fork);
                } else {
                    queue.push_back(fork);
                }
            }
        }
        false
    }

    /// Repeatedly advances `stack` without splitting until it gains
    /// position (pushed into `new_stacks`, returns `None`) or gets stuck
    /// (returned for further recovery).
    fn advance_fully(
        &mut self,
        grammar: &LrGrammar,
        mut stack: Stack,
        new_stacks: &mut Vec<Stack>,
    ) -> Option<Stack> {
        let pos = stack.pos();
        loop {
            if !self.advance_stack(grammar, &mut stack, None) {
                return Some(stack);
            }
            if stack.pos() > pos {
                push_stack_dedup(stack, new_stacks);
                return None;
            }
        }
    }

    /// One recovery round over the stuck stacks. Returns a finished stack
    /// when one reaches the end of the input without a way to continue.
    fn run_recovery(
        &mut self,
        grammar: &LrGrammar,
        stacks: Vec<Stack>,
        tokens: &[(u16, u32)],
        new_stacks: &mut Vec<Stack>,
    ) -> Option<Stack> {
        let mut finished: Option<Stack> = None;
        let mut restarted = false;

        for (i, mut stack) in stacks.into_iter().enumerate() {
            let (mut token, mut token_end) = tokens[i];
            debug!(stack = stack.id(), pos = stack.pos(), token, "recovering");

            if stack.dead_end(grammar) {
                if restarted {
                    continue;
                }
                restarted = true;
                {
                    let mut cx = StackCx {
                        grammar,
                        shared: &mut self.shared,
                        stream: &mut self.stream,
                    };
                    stack.restart(&mut cx);
                }
                match self.advance_fully(grammar, stack, new_stacks) {
                    None => continue,
                    Some(stuck) => stack = stuck,
                }
            }

            // Try forcing reductions to reach a state that can continue.
            let mut force = stack.split(&mut self.shared);
            for _ in 0..driver::FORCE_REDUCE_LIMIT {
                let reduced = {
                    let mut cx = StackCx {
                        grammar,
                        shared: &mut self.shared,
                        stream: &mut self.stream,
                    };
                    force.force_reduce(&mut cx)
                };
                if !reduced {
                    break;
                }
                match self.advance_fully(grammar, force, new_stacks) {
                    None => break,
                    Some(stuck) => force = stuck.split(&mut self.shared),
                }
            }

            let inserts = {
                let mut cx = StackCx {
                    grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                stack.recover_by_insert(&mut cx, token)
            };
            for insert in inserts {
                let _ = self.advance_fully(grammar, insert, new_stacks);
            }

            if self.stream.end() > stack.pos() {
                if token_end == stack.pos() {
                    token_end += 1;
                    token = ERROR_TERM;
                }
                let mut cx = StackCx {
                    grammar,
                    shared: &mut self.shared,
                    stream: &mut self.stream,
                };
                stack.recover_by_delete(&mut cx, token, token_end);
                push_stack_dedup(stack, new_stacks);
            } else if finished.as_ref().map_or(true, |best| best.score() < stack.score()) {
                finished = Some(stack);
            }
        }
        finished
    }

    /// Mounts nested-parse results recorded for `stack`, if its pending
    /// reductions no longer overlap the candidate region.
    fn check_nest(&mut self, grammar: &LrGrammar, stack: &mut Stack) {
        let Some(&candidate) = self.shared.nest_candidates.get(&stack.id()) else {
            return;
        };
        if stack.may_nest_from(grammar, &[candidate.term]).is_some() {
            // An enclosing reduction of the same nestable term is still
            // open; revisit once it completes.
            return;
        }
        self.shared.nest_candidates.remove(&stack.id());
        let Some(factory) = grammar.nested(candidate.term).map(Rc::clone) else {
            return;
        };
        if let Some(tree) = factory(&mut self.stream, stack, candidate.start, candidate.end) {
            debug!(term = candidate.term, start = candidate.start, "mounting nested parse");
            let mut cx = StackCx {
                grammar,
                shared: &mut self.shared,
                stream: &mut self.stream,
            };
            stack.mount(&mut cx, Rc::new(tree));
        }
    }

    fn find_finished(&mut self, grammar: &LrGrammar, stopped: &mut Vec<Stack>) -> Option<Stack> {
        let mut best: Option<usize> = None;
        for (i, stack) in stopped.iter().enumerate() {
            if stack.pos() == self.stream.end()
                && grammar.state_flag(stack.state(), state_flag::ACCEPTING)
                && best.map_or(true, |at| stopped[at].score() < stack.score())
            {
                best = Some(i);
            }
        }
        best.map(|at| stopped.swap_remove(at))
    }

    fn stack_to_tree(&mut self, grammar: &LrGrammar, mut stack: Stack) -> Tree {
        stack.close();
        debug!(
            score = stack.score(),
            buffer = stack.buffer_base() as usize + stack.buffer_len(),
            "building tree"
        );
        let length = stack.pos() - self.start_pos;
        let tree = Tree::build(
            StackBufferCursor::at_end(&stack),
            &self.build_params(grammar, length),
        );
        // The top rule's reduce leaves a record for the root node itself;
        // unwrap it rather than nesting two nodes of the same type.
        if tree.children().len() == 1 {
            let child = &tree.children()[0];
            if child.kind().id() == self.top_term
                && tree.child_offset(0) == 0
                && child.len() == tree.len()
            {
                return (**child).clone();
            }
        }
        tree
    }

    fn build_params<'a>(&'a self, grammar: &'a LrGrammar, length: u32) -> BuildParams<'a> {
        BuildParams {
            node_set: grammar.node_set(),
            top: self.top_term,
            start: self.start_pos,
            length,
            reused: &self.shared.reused,
            prop_values: &self.shared.prop_values,
            min_repeat_term: grammar.min_repeat_term(),
        }
    }
}

fn push_stack_dedup(stack: Stack, stacks: &mut Vec<Stack>) {
    for other in stacks.iter_mut() {
        if other.pos() == stack.pos() && other.same_state(&stack) {
            if other.score() < stack.score() {
                *other = stack;
            }
            return;
        }
    }
    stacks.push(stack);
}

/// A loaded parser: the façade driving [`ParseSession`]s over a grammar.
#[derive(Debug)]
pub struct LrParser {
    grammar: Rc<LrGrammar>,
}

impl LrParser {
    /// Wraps a grammar, checking that every tokenizer slot is resolved and
    /// a top rule exists.
    pub fn new(grammar: LrGrammar) -> Result<Self, GrammarError> {
        if let Some(name) = grammar.unresolved_tokenizer() {
            return Err(GrammarError::UnresolvedTokenizer(name.clone()));
        }
        if grammar.top_rule(None).is_none() {
            return Err(GrammarError::BadTopRule("".into()));
        }
        Ok(Self {
            grammar: Rc::new(grammar),
        })
    }

    /// The wrapped grammar.
    #[must_use]
    pub fn grammar(&self) -> &LrGrammar {
        &self.grammar
    }

    /// Parses `input` with default options. Never fails: errors surface as
    /// error nodes in the tree.
    #[must_use]
    pub fn parse(&self, input: &str) -> Tree {
        match self.parse_with(&input, ParseOptions::default()) {
            Ok(tree) => tree,
            // Non-strict parses always produce a tree.
            Err(err) => unreachable!("recovering parse failed: {err}"),
        }
    }

    /// Parses with explicit options; strict mode reports the first syntax
    /// error, and options naming an unknown top rule report a grammar
    /// error.
    pub fn parse_with(&self, input: &dyn Input, options: ParseOptions) -> Result<Tree, ParseError> {
        let mut session = ParseSession::new(Rc::clone(&self.grammar), input, options)?;
        session.run()
    }

    /// Starts a streaming parse the caller advances round by round.
    pub fn session<'i>(
        &self,
        input: &'i dyn Input,
        options: ParseOptions,
    ) -> Result<ParseSession<'i>, GrammarError> {
        ParseSession::new(Rc::clone(&self.grammar), input, options)
    }
}
