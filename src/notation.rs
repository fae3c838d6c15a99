//! Text notation for formulas.
//!
//! Parses strings like `"Surv(time, status) ~ rcs(age, 4) + sex*treat + strat(site)"`
//! into a [`Formula`]. The left-hand side is optional and ignored; time and status
//! always come from the dataset.
//!
//! Supported terms:
//! - `x` - linear main effect
//! - `rcs(x, k)` / `rcs(x, c(20, 40, 60))` / `rcs(x)` - restricted cubic spline
//! - `a*b`, `a:b` - interaction (main effects are always implied)
//! - `strat(x)` - stratification

use crate::error::{Result, SurvivalError};
use crate::formula::{Formula, Term};

/// knots used by a bare `rcs(x)`
pub const DEFAULT_SPLINE_KNOTS: usize = 5;

/// Parse a formula string.
pub fn parse_formula(text: &str) -> Result<Formula> {
    let rhs = match text.split_once('~') {
        Some((_, rhs)) if rhs.contains('~') => {
            return Err(SurvivalError::formula(format!(
                "formula may contain at most one '~': {}",
                text
            )))
        }
        Some((_, rhs)) => rhs,
        None => text,
    };

    let pieces = split_top_level(rhs, &['+'])?;
    if pieces.iter().all(|p| p.trim().is_empty()) {
        return Err(SurvivalError::formula("formula has no terms"));
    }

    let mut formula = Formula::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(SurvivalError::formula(format!("empty term in `{}`", rhs.trim())));
        }
        formula = formula.term(parse_term(piece)?);
    }
    Ok(formula)
}

/// one `+`-separated piece; `*` and `:` fold left into nested interactions
fn parse_term(piece: &str) -> Result<Term> {
    let factors = split_top_level(piece, &['*', ':'])?;
    let mut terms = factors.into_iter().map(|f| {
        let f = f.trim();
        if f.is_empty() {
            Err(SurvivalError::formula(format!("dangling interaction in `{}`", piece)))
        } else {
            parse_atom(f)
        }
    });

    // split always yields at least one piece
    let mut term = match terms.next() {
        Some(first) => first?,
        None => return Err(SurvivalError::formula(format!("empty term `{}`", piece))),
    };
    for next in terms {
        term = Term::interaction(term, next?);
    }
    Ok(term)
}

fn parse_atom(atom: &str) -> Result<Term> {
    let Some(open) = atom.find('(') else {
        return Ok(Term::linear(identifier(atom)?));
    };
    if !atom.ends_with(')') {
        return Err(SurvivalError::formula(format!("unbalanced parentheses in `{}`", atom)));
    }

    let function = atom[..open].trim();
    let inner = &atom[open + 1..atom.len() - 1];
    let args = split_top_level(inner, &[','])?;

    match function {
        "rcs" => parse_spline(atom, &args),
        "strat" | "strata" => match args.as_slice() {
            [variable] => Ok(Term::strata(identifier(variable.trim())?)),
            _ => Err(SurvivalError::formula(format!("strat() takes one variable: `{}`", atom))),
        },
        other => Err(SurvivalError::formula(format!("unknown function `{}` in `{}`", other, atom))),
    }
}

fn parse_spline(atom: &str, args: &[&str]) -> Result<Term> {
    match args {
        [variable] => Ok(Term::spline(identifier(variable.trim())?, DEFAULT_SPLINE_KNOTS)),
        [variable, knots] => {
            let variable = identifier(variable.trim())?;
            let knots = knots.trim();
            if let Some(list) = knots.strip_prefix("c(").and_then(|k| k.strip_suffix(')')) {
                let locations = list
                    .split(',')
                    .map(|k| {
                        k.trim().parse::<f64>().map_err(|_| {
                            SurvivalError::formula(format!("bad knot location `{}` in `{}`", k.trim(), atom))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                Ok(Term::spline_at(variable, locations))
            } else {
                let k = knots
                    .parse::<usize>()
                    .map_err(|_| SurvivalError::formula(format!("bad knot count `{}` in `{}`", knots, atom)))?;
                Ok(Term::spline(variable, k))
            }
        }
        _ => Err(SurvivalError::formula(format!(
            "rcs() takes a variable and optionally a knot count: `{}`",
            atom
        ))),
    }
}

fn identifier(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.'),
        _ => false,
    };
    if valid {
        Ok(name.to_string())
    } else {
        Err(SurvivalError::formula(format!("`{}` isn't a variable name", name)))
    }
}

/// split on any of `separators` outside parentheses
fn split_top_level<'a>(text: &'a str, separators: &[char]) -> Result<Vec<&'a str>> {
    let mut pieces = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SurvivalError::formula(format!("unbalanced parentheses in `{}`", text)));
                }
            }
            c if depth == 0 && separators.contains(&c) => {
                pieces.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SurvivalError::formula(format!("unbalanced parentheses in `{}`", text)));
    }
    pieces.push(&text[start..]);
    Ok(pieces)
}
