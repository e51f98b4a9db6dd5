//! Shared fixtures for engine tests: a small hand-built expression grammar
//! plus helpers for assembling packed tables.
#![allow(dead_code)]

use indexmap::IndexMap;

use sylva_parse::constants::{action, seq, state_flag};
use sylva_parse::{GrammarSpec, LrGrammar, LrParser, TokenizerSpec, TopRule};

// Terms of the expression grammar.
pub const ERR: u16 = 0;
pub const TOP: u16 = 1;
pub const NUMBER: u16 = 2;
pub const SUM: u16 = 3;
pub const SPACE: u16 = 4;
pub const PLUS: u16 = 5;
pub const EOF: u16 = 6;

/// Packs a reduce action.
pub fn reduce(term: u16, depth: u32) -> u32 {
    (depth << action::REDUCE_DEPTH_SHIFT) | action::REDUCE_FLAG | u32::from(term)
}

/// Appends a `(term, action)` sequence to `data`, returning its offset.
pub fn push_seq(data: &mut Vec<u16>, entries: &[(u16, u32)]) -> u32 {
    let at = data.len() as u32;
    for &(term, act) in entries {
        data.push(term);
        data.push((act & 0xFFFF) as u16);
        data.push((act >> 16) as u16);
    }
    data.push(seq::END);
    data.push(seq::DONE);
    at
}

/// Builds a goto table covering `term_count` terms from
/// `(term, target, source states)` entries (one group per term).
pub fn build_goto(term_count: u16, entries: &[(u16, u16, &[u16])]) -> Vec<u16> {
    let mut table = vec![term_count];
    table.extend(std::iter::repeat(0).take(term_count as usize));
    for term in 0..term_count {
        table[1 + term as usize] = table.len() as u16;
        match entries.iter().find(|entry| entry.0 == term) {
            None => table.extend([1, 0]),
            Some(&(_, target, states)) => {
                table.push(((states.len() as u16) << 1) | 1);
                table.push(target);
                table.extend_from_slice(states);
            }
        }
    }
    table
}

/// Token DFA over group 0: numbers (digit runs), `+`, and space runs.
pub fn expr_token_data() -> Vec<u16> {
    vec![
        // state 0: dispatch on the first unit
        1, 3, 3, 32, 33, 12, 43, 44, 20, 48, 58, 25,
        // state 12: inside a space run, accepts SPACE
        1, 17, 1, SPACE, 1, 32, 33, 12,
        // state 20: after `+`, accepts PLUS
        1, 25, 0, PLUS, 1,
        // state 25: inside a number, accepts NUMBER
        1, 30, 1, NUMBER, 1, 48, 58, 25,
    ]
}

/// The expression grammar:
///
/// ```text
/// Top := Sum eof        Sum := Number | Sum '+' Number
/// ```
///
/// with spaces as skipped tokens. States:
///
/// - 0: start, shifts a Number
/// - 1: after Number, reduces `Sum := Number`
/// - 2: after Sum, shifts `+` or reduces `Top := Sum` on eof
/// - 3: after `+`, shifts a Number
/// - 4: after `Sum + Number`, reduces the three-deep Sum
/// - 5: accepting
pub fn expr_spec() -> GrammarSpec {
    let mut data = Vec::new();
    let empty = push_seq(&mut data, &[]);
    let skip = push_seq(&mut data, &[(SPACE, action::STAY_FLAG)]);
    let s0 = push_seq(&mut data, &[(NUMBER, 1)]);
    let s2 = push_seq(&mut data, &[(PLUS, 3), (EOF, reduce(TOP, 1))]);
    let s3 = push_seq(&mut data, &[(NUMBER, 4)]);

    let states = vec![
        0, s0, skip, 1, 0, 0, //
        0, empty, skip, 1, reduce(SUM, 1), reduce(SUM, 1), //
        0, s2, skip, 1, 0, reduce(TOP, 1), //
        0, s3, skip, 1, 0, reduce(SUM, 2), //
        0, empty, skip, 1, reduce(SUM, 3), reduce(SUM, 3), //
        state_flag::ACCEPTING, empty, skip, 1, 0, 0, //
    ];

    GrammarSpec {
        version: 1,
        states,
        data,
        goto_table: build_goto(4, &[(TOP, 5, &[0]), (SUM, 2, &[0])]),
        node_names: vec![
            "\u{26a0}".into(),
            "Top".into(),
            "Number".into(),
            "Sum".into(),
            "Space".into(),
        ],
        skipped_nodes: vec![SPACE],
        repeat_node_count: 0,
        max_term: EOF,
        eof_term: EOF,
        top_rules: IndexMap::from([("Top".to_string(), TopRule { state: 0, term: TOP })]),
        dynamic_precedences: Vec::new(),
        token_prec: Vec::new(),
        token_data: expr_token_data(),
        tokenizers: vec![TokenizerSpec::Group(0)],
        dialects: IndexMap::new(),
    }
}

pub fn expr_grammar() -> LrGrammar {
    LrGrammar::from_spec(expr_spec()).unwrap()
}

pub fn expr_parser() -> LrParser {
    LrParser::new(expr_grammar()).unwrap()
}

/// A grammar whose start state already accepts; used for the empty-input
/// and idempotence checks.
pub fn accepting_start_grammar() -> LrGrammar {
    let mut data = Vec::new();
    let empty = push_seq(&mut data, &[]);
    LrGrammar::from_spec(GrammarSpec {
        version: 1,
        states: vec![state_flag::ACCEPTING, empty, empty, 1, 0, 0],
        data,
        goto_table: build_goto(1, &[]),
        node_names: vec!["\u{26a0}".into(), "Top".into()],
        skipped_nodes: Vec::new(),
        repeat_node_count: 0,
        max_term: 2,
        eof_term: 2,
        top_rules: IndexMap::from([("Top".to_string(), TopRule { state: 0, term: 1 })]),
        dynamic_precedences: Vec::new(),
        token_prec: Vec::new(),
        token_data: vec![0, 3, 0],
        tokenizers: vec![TokenizerSpec::Group(0)],
        dialects: IndexMap::new(),
    })
    .unwrap()
}

/// Two inert states and node terms up to 5, for direct stack-operation
/// checks (shift, reduce arithmetic, buffer layout).
pub fn shift_reduce_grammar() -> LrGrammar {
    let mut data = Vec::new();
    let empty = push_seq(&mut data, &[]);
    LrGrammar::from_spec(GrammarSpec {
        version: 1,
        states: vec![
            0, empty, empty, 1, 0, 0, //
            0, empty, empty, 1, 0, 0, //
        ],
        data,
        goto_table: build_goto(6, &[(5, 1, &[0])]),
        node_names: vec![
            "\u{26a0}".into(),
            "Doc".into(),
            "T2".into(),
            "T3".into(),
            "T4".into(),
            "T5".into(),
        ],
        skipped_nodes: Vec::new(),
        repeat_node_count: 0,
        max_term: 7,
        eof_term: 7,
        top_rules: IndexMap::from([("Doc".to_string(), TopRule { state: 0, term: 1 })]),
        dynamic_precedences: Vec::new(),
        token_prec: Vec::new(),
        token_data: vec![0, 3, 0],
        tokenizers: vec![TokenizerSpec::Group(0)],
        dialects: IndexMap::new(),
    })
    .unwrap()
}

/// A state with twenty shift edges, to exercise the insert-recovery cap.
pub fn wide_insert_grammar() -> LrGrammar {
    let mut data = Vec::new();
    let empty = push_seq(&mut data, &[]);
    let shared = push_seq(&mut data, &[(9, 1)]);
    let entries: Vec<(u16, u32)> = (0..20).map(|i| (10 + i as u16, 1 + i)).collect();
    let wide = push_seq(&mut data, &entries);

    let mut states = vec![0, wide, empty, 1, 0, 0];
    for _ in 0..20 {
        states.extend([0, shared, empty, 1, 0, 0]);
    }
    LrGrammar::from_spec(GrammarSpec {
        version: 1,
        states,
        data,
        goto_table: build_goto(1, &[]),
        node_names: vec!["\u{26a0}".into()],
        skipped_nodes: Vec::new(),
        repeat_node_count: 0,
        max_term: 40,
        eof_term: 40,
        top_rules: IndexMap::from([("Doc".to_string(), TopRule { state: 0, term: 0 })]),
        dynamic_precedences: Vec::new(),
        token_prec: Vec::new(),
        token_data: vec![0, 3, 0],
        tokenizers: vec![TokenizerSpec::Group(0)],
        dialects: IndexMap::new(),
    })
    .unwrap()
}

/// Asserts that every node record's size covers exactly the records built
/// into it, and that child spans stay inside their parent's span.
pub fn check_buffer_sizes(buffer: &[i32]) {
    fn consume(buffer: &[i32], end: usize) -> usize {
        let size = buffer[end - 1];
        if size < 0 {
            return end - 4;
        }
        let start = end - size as usize;
        let (parent_start, parent_end) = (buffer[end - 3], buffer[end - 2]);
        let mut at = end - 4;
        while at > start {
            let child_size = buffer[at - 1];
            if child_size >= 4 || child_size == -1 {
                assert!(
                    buffer[at - 3] >= parent_start && buffer[at - 2] <= parent_end,
                    "child at {at} escapes its parent"
                );
            }
            let child_start = consume(buffer, at);
            assert!(child_start >= start, "child at {at} crosses its parent");
            at = child_start;
        }
        assert_eq!(at, start, "size accounting broken at {end}");
        start
    }

    let mut index = buffer.len();
    while index > 0 {
        index = consume(buffer, index);
    }
}
