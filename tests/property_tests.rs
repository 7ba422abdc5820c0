//! Robustness and law-style properties over generated inputs.

use neo_yul::compiler::{compile, CompilerConfig};
use neo_yul::lexer::{parse_word, Lexer};
use neo_yul::parser::parse_source;
use proptest::prelude::*;

proptest! {
    /// The lexer reports errors, it never panics, on arbitrary ASCII.
    #[test]
    fn lexer_total_over_ascii(input in "[ -~\\n\\t]{0,200}") {
        let _ = Lexer::new(&input).tokenize();
    }

    /// Same for the full parser front end.
    #[test]
    fn parser_total_over_ascii(input in "[ -~\\n\\t]{0,200}") {
        let _ = parse_source(&input);
    }

    /// Number literals survive the lexer regardless of magnitude.
    #[test]
    fn number_literals_round_trip(value in any::<u128>()) {
        let source = format!("{{ let x := {value} pop(x) }}");
        let (object, errors) = parse_source(&source);
        prop_assert!(errors.is_empty());
        prop_assert!(object.is_some());
        prop_assert_eq!(
            parse_word(&value.to_string()).unwrap(),
            num_bigint::BigUint::from(value)
        );
    }

    /// Identifier-shaped names always parse as declarations.
    #[test]
    fn identifiers_parse(name in "[a-zA-Z_][a-zA-Z0-9_]{0,30}") {
        // Skip the reserved words the generator can stumble into.
        prop_assume!(!matches!(
            name.as_str(),
            "object" | "code" | "data" | "function" | "let" | "if" | "switch"
                | "case" | "default" | "for" | "break" | "continue" | "leave"
                | "true" | "false"
        ));
        let source = format!("{{ let {name} := 1 pop({name}) }}");
        let (object, errors) = parse_source(&source);
        prop_assert!(errors.is_empty(), "errors for '{}': {:?}", name, errors);
        prop_assert!(object.is_some());
    }

    /// Pretty-printing then reparsing is structurally stable.
    #[test]
    fn print_parse_fixpoint(a in 0u64..1000, b in 0u64..1000) {
        let source = format!(
            "{{ let x := add({a}, {b}) if lt(x, {b}) {{ x := {a} }} pop(x) }}"
        );
        let (object, errors) = parse_source(&source);
        prop_assert!(errors.is_empty());
        let printed = object.unwrap().to_string();
        let (reparsed, errors) = parse_source(&printed);
        prop_assert!(errors.is_empty());
        prop_assert_eq!(reparsed.unwrap().to_string(), printed);
    }

    /// Compilation of a tiny storage program is deterministic for any
    /// slot/value pair.
    #[test]
    fn small_programs_are_deterministic(slot in 0u64..100, value in any::<u64>()) {
        let source = format!("{{ sstore({slot}, {value}) }}");
        let config = CompilerConfig::default();
        let first = compile(&source, &config);
        let second = compile(&source, &config);
        prop_assert!(first.succeeded());
        let a = first.artifact.unwrap();
        let b = second.artifact.unwrap();
        prop_assert_eq!(a.runtime, b.runtime);
        prop_assert_eq!(a.nef, b.nef);
    }
}
