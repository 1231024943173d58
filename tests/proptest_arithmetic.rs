//! Property-based tests for expression evaluation.
//!
//! Randomly generated integer expressions are compiled, run on the VM and
//! compared against the same expression evaluated in Rust with wrapping
//! arithmetic.

use cobra::runtime::{Vm, VmConfig};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Num(i32),
    Neg(Box<Expr>),
    Bin(char, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self) -> i32 {
        match self {
            Expr::Num(n) => *n,
            Expr::Neg(e) => e.eval().wrapping_neg(),
            Expr::Bin(op, a, b) => {
                let (a, b) = (a.eval(), b.eval());
                match op {
                    '+' => a.wrapping_add(b),
                    '-' => a.wrapping_sub(b),
                    '*' => a.wrapping_mul(b),
                    '<' => (a < b) as i32,
                    _ => (a == b) as i32,
                }
            }
        }
    }

    /// Fully parenthesised source text.
    fn source(&self) -> String {
        match self {
            Expr::Num(n) => n.to_string(),
            Expr::Neg(e) => format!("-({})", e.source()),
            Expr::Bin('=', a, b) => format!("({} == {})", a.source(), b.source()),
            Expr::Bin(op, a, b) => format!("({} {} {})", a.source(), op, b.source()),
        }
    }
}

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = (0i32..1000).prop_map(Expr::Num);
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|e| Expr::Neg(Box::new(e))),
            (
                prop::sample::select(vec!['+', '-', '*', '<', '=']),
                inner.clone(),
                inner
            )
                .prop_map(|(op, a, b)| Expr::Bin(op, Box::new(a), Box::new(b))),
        ]
    })
}

/// A flat chain `n0 op n1 op n2 ...` with no parentheses.
fn arb_chain() -> impl Strategy<Value = (i32, Vec<(char, i32)>)> {
    (
        0i32..100,
        prop::collection::vec((prop::sample::select(vec!['+', '-', '*']), 0i32..100), 0..8),
    )
}

/// Evaluates a flat chain with `*` binding tighter than `+`/`-`, all left
/// associative.
fn eval_chain(first: i32, rest: &[(char, i32)]) -> i32 {
    let mut sum = 0i32;
    let mut sign = 1i32;
    let mut term = first;
    for &(op, n) in rest {
        match op {
            '*' => term = term.wrapping_mul(n),
            _ => {
                sum = sum.wrapping_add(sign.wrapping_mul(term));
                sign = if op == '+' { 1 } else { -1 };
                term = n;
            }
        }
    }
    sum.wrapping_add(sign.wrapping_mul(term))
}

fn run_print(expression: &str) -> String {
    let program = cobra::compile(&format!("print({});", expression)).unwrap();
    let mut vm = Vm::with_output(VmConfig::default(), Vec::new());
    vm.run_program(&program).unwrap();
    String::from_utf8(vm.into_output()).unwrap()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Unparenthesised chains follow the usual precedence and associativity.
    #[test]
    fn chain_matches_rust_precedence((first, rest) in arb_chain()) {
        let mut source = first.to_string();
        for (op, n) in &rest {
            source.push_str(&format!(" {} {}", op, n));
        }
        let expected = eval_chain(first, &rest);
        prop_assert_eq!(run_print(&source), format!("{}\n", expected), "source: {}", source);
    }

    /// Parenthesised trees evaluate exactly as written.
    #[test]
    fn tree_matches_rust_evaluation(expr in arb_expr()) {
        let source = expr.source();
        prop_assert_eq!(run_print(&source), format!("{}\n", expr.eval()), "source: {}", source);
    }

    /// `a < b` and `a == b` agree with Rust for any pair of literals.
    #[test]
    fn comparisons_match(a in 0i32..1000, b in 0i32..1000) {
        prop_assert_eq!(run_print(&format!("{} < {}", a, b)), format!("{}\n", (a < b) as i32));
        prop_assert_eq!(run_print(&format!("{} == {}", a, b)), format!("{}\n", (a == b) as i32));
        prop_assert_eq!(run_print(&format!("{} + 1 > {}", a, b)), format!("{}\n", (a + 1 > b) as i32));
    }
}
