mod common;
use common::*;

use std::rc::Rc;

use sylva_parse::{
    ContextTracker, ContextValue, ExternalTokenizer, Gap, GrammarError, GrammarSpec, InputStream,
    LrGrammar, LrParser, ParseOptions, TokenizerSpec, Tree,
};

#[test]
fn test_grammar_spec_serde_round_trip() {
    let spec = expr_spec();
    let json = serde_json::to_string(&spec).unwrap();
    let back: GrammarSpec = serde_json::from_str(&json).unwrap();
    assert_eq!(back.states, spec.states);
    assert_eq!(back.data, spec.data);
    assert_eq!(back.tokenizers, spec.tokenizers);
    let parser = LrParser::new(LrGrammar::from_spec(back).unwrap()).unwrap();
    assert!(!parser.parse("1+2").has_error());
}

#[test]
fn test_grammar_validation_errors() {
    let mut spec = expr_spec();
    spec.version = 99;
    assert!(matches!(
        LrGrammar::from_spec(spec),
        Err(GrammarError::UnsupportedVersion { found: 99 })
    ));

    let mut spec = expr_spec();
    spec.states.pop();
    assert!(matches!(
        LrGrammar::from_spec(spec),
        Err(GrammarError::MalformedStates(_))
    ));

    let mut spec = expr_spec();
    spec.skipped_nodes.push(40);
    assert!(matches!(
        LrGrammar::from_spec(spec),
        Err(GrammarError::BadSkippedNode(40))
    ));
}

#[test]
fn test_gap_spanning_token_gets_placeholder() {
    let parser = expr_parser();
    let tree = parser
        .parse_with(
            &"1~~2",
            ParseOptions {
                gaps: vec![Gap::new(1, 3)],
                ..ParseOptions::default()
            },
        )
        .unwrap();
    assert!(!tree.has_error());

    // The number token spans the gap; a placeholder child records the
    // excluded region.
    let sum = &tree.children()[0];
    let number = &sum.children()[0];
    assert_eq!(number.kind().name(), "Number");
    assert_eq!(u32::from(number.len()), 4);
    assert_eq!(number.children().len(), 1);
    let placeholder = &number.children()[0];
    assert_eq!(placeholder.kind().name(), "Placeholder");
    assert!(placeholder.kind().is_skipped());
    assert_eq!(number.child_offset(0), 1);
    assert_eq!(u32::from(placeholder.len()), 2);
}

#[test]
fn test_dialect_gates_tokens() {
    let mut spec = expr_spec();
    spec.dialects.insert("sums".to_string(), vec![PLUS]);

    let mut grammar = LrGrammar::from_spec(spec.clone()).unwrap();
    grammar.with_dialects(&["sums"]).unwrap();
    {
        let source = "1+2";
        let mut stream = sylva_parse::InputStream::new(&source, Vec::new().into());
        let mut shared = sylva_parse::ParseShared::new(Vec::new().into());
        let mut cx = sylva_parse::StackCx {
            grammar: &grammar,
            shared: &mut shared,
            stream: &mut stream,
        };
        let stack = sylva_parse::Stack::start(&mut cx, 0, 0);
        assert!(stack.dialect_enabled(&grammar, 0));
    }
    let parser = LrParser::new(grammar).unwrap();
    assert!(!parser.parse("1+2").has_error());

    let mut grammar = LrGrammar::from_spec(spec).unwrap();
    grammar.with_dialects(&[]).unwrap();
    let parser = LrParser::new(grammar).unwrap();
    assert!(parser.parse("1+2").has_error());

    let mut grammar = expr_grammar();
    assert!(matches!(
        grammar.with_dialects(&["nope"]),
        Err(GrammarError::UnknownDialect(_))
    ));
}

#[test]
fn test_external_tokenizer() {
    let mut spec = expr_spec();
    spec.tokenizers.push(TokenizerSpec::External("letters".to_string()));
    for state in 0..6 {
        spec.states[state * 6 + 3] = 0b11;
    }
    let mut grammar = LrGrammar::from_spec(spec).unwrap();
    assert_eq!(
        grammar.unresolved_tokenizer().map(|name| name.as_str()),
        Some("letters")
    );

    // Letter runs count as numbers.
    grammar
        .resolve_tokenizer(
            "letters",
            Rc::new(ExternalTokenizer::new(|input, _stack, _grammar| {
                let mut any = false;
                while (i32::from(b'a')..=i32::from(b'z')).contains(&input.next) {
                    input.advance();
                    any = true;
                }
                if any {
                    let end = input.pos();
                    input.accept_token_to(NUMBER, end);
                }
            })),
        )
        .unwrap();
    let parser = LrParser::new(grammar).unwrap();
    let tree = parser.parse("abc+1");
    assert!(!tree.has_error(), "tree:\n{}", tree.to_debug_string());
}

#[test]
fn test_unresolved_tokenizer_is_rejected() {
    let mut spec = expr_spec();
    spec.tokenizers.push(TokenizerSpec::External("letters".to_string()));
    let grammar = LrGrammar::from_spec(spec).unwrap();
    assert!(matches!(
        LrParser::new(grammar),
        Err(GrammarError::UnresolvedTokenizer(_))
    ));
}

struct NumberCounter;

impl ContextTracker for NumberCounter {
    fn start(&self) -> ContextValue {
        Rc::new(0u32)
    }

    fn shift(
        &self,
        context: &ContextValue,
        term: u16,
        _state: u32,
        _input: &mut InputStream<'_>,
    ) -> ContextValue {
        let count = *context.downcast_ref::<u32>().unwrap();
        if term == NUMBER {
            Rc::new(count + 1)
        } else {
            Rc::clone(context)
        }
    }

    fn hash(&self, context: &ContextValue) -> u32 {
        *context.downcast_ref::<u32>().unwrap()
    }
}

#[test]
fn test_context_tracker_hashes_land_in_tree() {
    let mut grammar = expr_grammar();
    grammar.set_context(Rc::new(NumberCounter));
    let parser = LrParser::new(grammar).unwrap();
    let tree = parser.parse("1+2");
    assert!(!tree.has_error());
    // The strict tracker flushes a final marker: two numbers were shifted.
    assert_eq!(tree.context_hash(), 2);
}

fn digits_factory(
    stream: &mut InputStream<'_>,
    _stack: &sylva_parse::Stack,
    from: u32,
    to: u32,
) -> Option<Tree> {
    assert_eq!(stream.read(from, to), "7");
    Some(Tree::leaf(
        sylva_parse::NodeType::new(0, "Digits", sylva_parse::NodeFlags::empty()),
        to - from,
    ))
}

#[test]
fn test_nested_parse_is_mounted() {
    let mut grammar = expr_grammar();
    grammar.set_nested(NUMBER, Rc::new(digits_factory));
    let parser = LrParser::new(grammar).unwrap();
    let tree = parser.parse("7");
    assert!(!tree.has_error());

    let sum = &tree.children()[0];
    let number = &sum.children()[0];
    assert_eq!(number.kind().name(), "Number");
    let mounted = number.mounted().expect("nested tree mounted");
    assert_eq!(mounted.kind().name(), "Digits");
    assert_eq!(u32::from(mounted.len()), 1);
}
