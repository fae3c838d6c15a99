//! Model formulas as explicit term trees.
//!
//! A formula is the right-hand side of `Surv(time, status) ~ ...`: an ordered
//! list of [`Term`]s. Textual notation lives in [`crate::notation`]; nothing in
//! the fitting path parses strings.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// main effect - one column for continuous, levels-1 indicators for categorical
    Linear(String),
    /// restricted cubic spline main effect
    Spline {
        variable: String,
        knots: usize,
        /// fixed knot locations; quantile placement when `None`
        locations: Option<Vec<f64>>,
    },
    /// product of every column pair of the two sides
    Interaction(Box<Term>, Box<Term>),
    /// partitions the risk sets, contributes no column
    Strata(String),
}

impl Term {
    pub fn linear(variable: impl Into<String>) -> Self {
        Term::Linear(variable.into())
    }

    pub fn spline(variable: impl Into<String>, knots: usize) -> Self {
        Term::Spline {
            variable: variable.into(),
            knots,
            locations: None,
        }
    }

    pub fn spline_at(variable: impl Into<String>, locations: Vec<f64>) -> Self {
        Term::Spline {
            variable: variable.into(),
            knots: locations.len(),
            locations: Some(locations),
        }
    }

    pub fn interaction(a: Term, b: Term) -> Self {
        Term::Interaction(Box::new(a), Box::new(b))
    }

    pub fn strata(variable: impl Into<String>) -> Self {
        Term::Strata(variable.into())
    }

    pub fn is_strata(&self) -> bool {
        matches!(self, Term::Strata(_))
    }

    pub fn is_interaction(&self) -> bool {
        matches!(self, Term::Interaction(..))
    }

    /// every variable the term touches, in order of appearance
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Linear(v) | Term::Strata(v) => vec![v.as_str()],
            Term::Spline { variable, .. } => vec![variable.as_str()],
            Term::Interaction(a, b) => {
                let mut vars = a.variables();
                for v in b.variables() {
                    if !vars.contains(&v) {
                        vars.push(v);
                    }
                }
                vars
            }
        }
    }

    /// structural equality that ignores the order of interaction sides
    pub fn same_as(&self, other: &Term) -> bool {
        match (self, other) {
            (Term::Interaction(a1, b1), Term::Interaction(a2, b2)) => {
                (a1.same_as(a2) && b1.same_as(b2)) || (a1.same_as(b2) && b1.same_as(a2))
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Linear(v) => write!(f, "{}", v),
            Term::Spline {
                variable,
                knots,
                locations: None,
            } => write!(f, "rcs({}, {})", variable, knots),
            Term::Spline {
                variable,
                locations: Some(locs),
                ..
            } => {
                let knots: Vec<String> = locs.iter().map(|k| format!("{}", k)).collect();
                write!(f, "rcs({}, c({}))", variable, knots.join(", "))
            }
            Term::Interaction(a, b) => write!(f, "{} * {}", a, b),
            Term::Strata(v) => write!(f, "strat({})", v),
        }
    }
}

/// ordered list of terms
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_terms(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    /// append a term
    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    pub fn linear(self, variable: impl Into<String>) -> Self {
        self.term(Term::linear(variable))
    }

    pub fn spline(self, variable: impl Into<String>, knots: usize) -> Self {
        self.term(Term::spline(variable, knots))
    }

    pub fn interaction(self, a: Term, b: Term) -> Self {
        self.term(Term::interaction(a, b))
    }

    pub fn strata(self, variable: impl Into<String>) -> Self {
        self.term(Term::strata(variable))
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// variables the formula references, deduplicated, in order
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for term in &self.terms {
            for v in term.variables() {
                if !vars.contains(&v) {
                    vars.push(v);
                }
            }
        }
        vars
    }

    /// the same formula without any term that shares a label with `term`
    pub fn without(&self, term: &Term) -> Formula {
        Formula {
            terms: self
                .terms
                .iter()
                .filter(|t| !t.same_as(term))
                .cloned()
                .collect(),
        }
    }

    /// terms after applying "interaction implies main effects"
    ///
    /// a missing constituent is inserted right before the first interaction that needs it;
    /// constituents that appear anywhere in the formula are left where the caller put them
    pub fn expanded_terms(&self) -> Vec<Term> {
        let mut out: Vec<Term> = Vec::new();
        for term in &self.terms {
            self.push_expanded(term, &mut out);
        }
        out
    }

    fn push_expanded(&self, term: &Term, out: &mut Vec<Term>) {
        if let Term::Interaction(a, b) = term {
            for side in [a.as_ref(), b.as_ref()] {
                let declared = self.terms.iter().any(|t| t.same_as(side));
                let emitted = out.iter().any(|t| t.same_as(side));
                if !declared && !emitted {
                    self.push_expanded(side, out);
                }
            }
        }
        if !out.iter().any(|t| t.same_as(term)) {
            out.push(term.clone());
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "Surv(time, status) ~ {}", terms.join(" + "))
    }
}
