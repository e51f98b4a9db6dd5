//! Tokenizers.
//!
//! Most tokens come out of [`TokenGroup`]s: interpreters over the packed
//! DFA data shipped with the grammar, each restricted to the token group
//! its id selects. [`ExternalTokenizer`] wraps arbitrary user recognition
//! for tokens the DFA cannot express.

use std::rc::Rc;

use crate::constants::seq;
use crate::grammar::LrGrammar;
use crate::input::{InputStream, Token};
use crate::stack::Stack;

/// Something that can read one token from the stream.
///
/// A tokenizer inspects `input.next`, advances as far as it needs, and
/// reports what it found through [`InputStream::accept_token`]. Leaving the
/// token unaccepted means "no token here".
pub trait Tokenizer {
    /// Reads one token at the stream's current position.
    fn token(&self, input: &mut InputStream<'_>, stack: &Stack, grammar: &LrGrammar);

    /// Contextual tokenizers depend on stack state; their results are never
    /// cached across stacks.
    fn contextual(&self) -> bool {
        false
    }

    /// Fallback tokenizers only run when a higher-precedence tokenizer
    /// produced a token the current state cannot act on.
    fn fallback(&self) -> bool {
        false
    }

    /// Extending tokenizers do not stop the tokenizer cascade after
    /// accepting a token.
    fn extend(&self) -> bool {
        false
    }
}

/// A tokenizer interpreting one group of the grammar's shared DFA data.
///
/// The data is a `u16` array holding one block per DFA state:
///
/// ```text
/// [group_mask, acc_end, edge_count,
///  (term, term_group_mask) * n,       // accepting pairs, until acc_end
///  (from, to, target) * edge_count]   // edges, half-open [from, to)
/// ```
///
/// `acc_end` is the absolute offset where the accepting pairs stop and the
/// edges begin; edge targets are state block offsets. An edge `to` of 0
/// stands for 0x10000, and an edge `from` of 0xFFFF matches end of input.
pub struct TokenGroup {
    data: Rc<[u16]>,
    group: u32,
}

impl TokenGroup {
    /// Creates the interpreter for group `group` of `data`.
    #[must_use]
    pub fn new(data: Rc<[u16]>, group: u32) -> Self {
        Self { data, group }
    }
}

impl Tokenizer for TokenGroup {
    fn token(&self, input: &mut InputStream<'_>, _stack: &Stack, grammar: &LrGrammar) {
        read_token(
            &self.data,
            1 << self.group,
            input,
            &|term| grammar.dialect().allows(term),
            &|term, prev| grammar.overrides(term, prev),
        );
    }
}

/// Walks the packed DFA, accepting the longest token of the active group.
///
/// At each state, accepting pairs whose mask overlaps the group may take
/// over the token: an empty token always loses, an equal term is kept, and
/// otherwise `overrides` decides. At most one accept fires per state.
pub(crate) fn read_token(
    data: &[u16],
    group_mask: u16,
    input: &mut InputStream<'_>,
    allows: &dyn Fn(u16) -> bool,
    overrides: &dyn Fn(u16, u16) -> bool,
) {
    let mut state = 0usize;
    'scan: loop {
        // A state whose mask misses the group cannot reach any of its tokens.
        if data[state] & group_mask == 0 {
            break;
        }
        let acc_end = data[state + 1] as usize;
        let edge_count = data[state + 2] as usize;

        let mut i = state + 3;
        while i < acc_end {
            if data[i + 1] & group_mask != 0 {
                let term = data[i];
                let current = input.token().value;
                if allows(term)
                    && (current == Token::NONE
                        || current == i32::from(term)
                        || overrides(term, current as u16))
                {
                    input.accept_token(term);
                    break;
                }
            }
            i += 2;
        }

        let next = input.next;
        if next < 0 {
            // A trailing edge with lower bound 0xFFFF matches end of input.
            if edge_count > 0 && data[acc_end + 3 * edge_count - 3] == seq::END {
                state = data[acc_end + 3 * edge_count - 1] as usize;
                continue 'scan;
            }
            break;
        }

        let mut lo = 0usize;
        let mut hi = edge_count;
        while lo < hi {
            let mid = (lo + hi) >> 1;
            let index = acc_end + mid * 3;
            let from = i32::from(data[index]);
            let to = if data[index + 1] == 0 {
                0x1_0000
            } else {
                i32::from(data[index + 1])
            };
            if next < from {
                hi = mid;
            } else if next >= to {
                lo = mid + 1;
            } else {
                state = data[index + 2] as usize;
                input.advance();
                continue 'scan;
            }
        }
        break;
    }
}

type TokenizeFn = Box<dyn Fn(&mut InputStream<'_>, &Stack, &LrGrammar)>;

/// A user-supplied tokenizer.
pub struct ExternalTokenizer {
    read: TokenizeFn,
    contextual: bool,
    fallback: bool,
    extend: bool,
}

impl ExternalTokenizer {
    /// Wraps a recognition function.
    #[must_use]
    pub fn new(read: impl Fn(&mut InputStream<'_>, &Stack, &LrGrammar) + 'static) -> Self {
        Self {
            read: Box::new(read),
            contextual: false,
            fallback: false,
            extend: false,
        }
    }

    /// Marks this tokenizer as depending on stack state.
    #[must_use]
    pub fn contextual(mut self) -> Self {
        self.contextual = true;
        self
    }

    /// Makes this tokenizer run only as a fallback.
    #[must_use]
    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Keeps the tokenizer cascade running after this tokenizer accepts.
    #[must_use]
    pub fn extend(mut self) -> Self {
        self.extend = true;
        self
    }
}

impl Tokenizer for ExternalTokenizer {
    fn token(&self, input: &mut InputStream<'_>, stack: &Stack, grammar: &LrGrammar) {
        (self.read)(input, stack, grammar);
    }

    fn contextual(&self) -> bool {
        self.contextual
    }

    fn fallback(&self) -> bool {
        self.fallback
    }

    fn extend(&self) -> bool {
        self.extend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A two-state DFA for `a+` (term 5) in group 0: state 0 requires one
    // `a`, state block 6 accepts and loops on further `a`s.
    fn a_plus() -> Vec<u16> {
        vec![
            1, 3, 1, 97, 98, 6, // state 0
            1, 11, 1, 5, 1, 97, 98, 6, // state block 6
        ]
    }

    fn always(_: u16) -> bool {
        true
    }

    fn never_overrides(_: u16, _: u16) -> bool {
        false
    }

    #[test]
    fn test_dfa_accepts_longest_match() {
        let data = a_plus();
        let source = "aab";
        let mut stream = InputStream::new(&source, Vec::new().into());
        stream.reset(0, Some(Token::none_at(0)));
        read_token(&data, 1, &mut stream, &always, &never_overrides);
        assert_eq!(stream.token().value, 5);
        assert_eq!(stream.token().end, 2);
        // The DFA looked at the `b` before giving up.
        assert_eq!(stream.token().look_ahead, 3);
    }

    #[test]
    fn test_dfa_rejects_wrong_start() {
        let data = a_plus();
        let source = "ba";
        let mut stream = InputStream::new(&source, Vec::new().into());
        stream.reset(0, Some(Token::none_at(0)));
        read_token(&data, 1, &mut stream, &always, &never_overrides);
        assert_eq!(stream.token().value, Token::NONE);
    }

    #[test]
    fn test_dfa_inactive_group_mask() {
        let data = a_plus();
        let source = "aa";
        let mut stream = InputStream::new(&source, Vec::new().into());
        stream.reset(0, Some(Token::none_at(0)));
        // Group 1 is not present in any state mask.
        read_token(&data, 1 << 1, &mut stream, &always, &never_overrides);
        assert_eq!(stream.token().value, Token::NONE);
    }

    #[test]
    fn test_dfa_dialect_filter() {
        let data = a_plus();
        let source = "aa";
        let mut stream = InputStream::new(&source, Vec::new().into());
        stream.reset(0, Some(Token::none_at(0)));
        read_token(&data, 1, &mut stream, &|term| term != 5, &never_overrides);
        assert_eq!(stream.token().value, Token::NONE);
    }
}
