mod common;
use common::*;

use sylva_parse::{InputStream, ParseShared, Stack, StackCx, ERROR_TERM};

#[test]
fn test_adjacent_error_nodes_coalesce() {
    let grammar = shift_reduce_grammar();
    let source = "xx";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let mut stack = Stack::start(&mut cx, 0, 0);

    stack.store_node(&mut cx, ERROR_TERM, 0, 1, 4, false);
    stack.store_node(&mut cx, ERROR_TERM, 1, 2, 4, false);
    assert_eq!(stack.local_buffer(), vec![0, 0, 2, 4]);

    // Zero-width additions next to an existing error are dropped.
    stack.store_node(&mut cx, ERROR_TERM, 2, 2, 4, false);
    assert_eq!(stack.local_buffer(), vec![0, 0, 2, 4]);
}

#[test]
fn test_recover_by_insert_respects_cap() {
    let grammar = wide_insert_grammar();
    let source = "";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let stack = Stack::start(&mut cx, 0, 0);

    assert_eq!(grammar.next_states(0).len(), 20);
    let forks = stack.recover_by_insert(&mut cx, 9);
    assert!(!forks.is_empty());
    assert!(forks.len() <= 4, "fork fanout above MaxNext: {}", forks.len());
    for fork in &forks {
        assert_eq!(fork.score(), -200);
        // Each fork inserted a zero-width error node.
        assert_eq!(fork.local_buffer()[3], 4);
        assert_eq!(fork.local_buffer()[0], i32::from(ERROR_TERM));
    }
}

#[test]
fn test_recover_by_delete_skips_token() {
    let grammar = expr_grammar();
    let source = "1?2";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let mut stack = Stack::start(&mut cx, 0, 0);

    stack.apply(&mut cx, 1, NUMBER, 1);
    let score_before = stack.score();
    stack.recover_by_delete(&mut cx, ERROR_TERM, 2);
    assert_eq!(stack.pos(), 2);
    assert_eq!(stack.reduce_pos(), 2);
    assert_eq!(stack.score(), score_before - 190);
    // The deleted region shows up as an error node.
    let buffer = stack.local_buffer();
    assert_eq!(&buffer[buffer.len() - 4..], &[0, 1, 2, 4]);
}

#[test]
fn test_unfinished_input_recovers_with_error_node() {
    let parser = expr_parser();
    let tree = parser.parse("1+");
    assert!(tree.has_error());
    assert_eq!(tree.kind().name(), "Top");
    assert_eq!(u32::from(tree.len()), 2);
}

#[test]
fn test_garbage_input_still_produces_tree() {
    let parser = expr_parser();
    let tree = parser.parse("@@");
    assert!(tree.has_error());
    assert_eq!(tree.kind().name(), "Top");
}

#[test]
fn test_error_in_the_middle_keeps_good_parts() {
    let parser = expr_parser();
    let tree = parser.parse("1+?+2");
    assert!(tree.has_error());
    // Both numbers survive in the tree despite the recovery.
    let dump = tree.to_debug_string();
    assert!(dump.contains("Number@0..1"), "dump:\n{dump}");
    assert!(dump.contains("Number@4..5"), "dump:\n{dump}");
}

#[test]
fn test_dead_end_and_restart() {
    let grammar = shift_reduce_grammar();
    let source = "x";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let mut stack = Stack::start(&mut cx, 0, 0);
    assert!(!stack.dead_end(&grammar), "fresh stack has no frame yet");

    stack.apply(&mut cx, 1, 3, 1);
    assert!(stack.dead_end(&grammar), "state 1 has no actions");

    stack.restart(&mut cx);
    assert_eq!(stack.state(), 0);
    assert_eq!(stack.depth(), 0);
    let buffer = stack.local_buffer();
    assert_eq!(&buffer[buffer.len() - 4..], &[0, 1, 1, 4]);
}

#[test]
fn test_force_reduce_penalizes_invalid_action() {
    let grammar = expr_grammar();
    let source = "1+";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let mut stack = Stack::start(&mut cx, 0, 0);

    stack.apply(&mut cx, 1, NUMBER, 1);
    stack.apply(&mut cx, reduce(SUM, 1), 0, 1);
    stack.apply(&mut cx, 3, PLUS, 2);

    // State 3's forced reduction is not among its actions, so applying it
    // costs score and leaves an error node.
    assert!(stack.force_reduce(&mut cx));
    assert_eq!(stack.score(), -100);
    assert_eq!(stack.state(), 2);
    let buffer = stack.local_buffer();
    assert!(buffer.chunks(4).any(|record| record[0] == 0 && record[3] == 4));
    check_buffer_sizes(&buffer);
}

#[test]
fn test_force_all_reaches_accepting_state() {
    let grammar = expr_grammar();
    let source = "1";
    let mut stream = InputStream::new(&source, Vec::new().into());
    let mut shared = ParseShared::new(Vec::new().into());
    let mut cx = StackCx {
        grammar: &grammar,
        shared: &mut shared,
        stream: &mut stream,
    };
    let mut stack = Stack::start(&mut cx, 0, 0);

    stack.apply(&mut cx, 1, NUMBER, 1);
    stack.force_all(&mut cx);
    assert_eq!(stack.state(), 5);
    assert!(grammar.state_flag(
        stack.state(),
        sylva_parse::constants::state_flag::ACCEPTING
    ));
}
