use std::collections::HashMap;

use crate::core::comparator::ToleranceMode;

/// Upper bound on the number of values a single generated input may hold.
pub const MAX_CELLS: u64 = 1_000_000;

const DEFAULT_ALPHABET: &str = "a-z";

#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintSet {
    pub fields: Vec<Field>,
    /// Set by an `@tolerance` directive: outputs are floating point.
    pub tolerance: Option<ToleranceMode>,
}

impl ConstraintSet {
    /// What unparseable specifications fall back to: one small integer.
    pub fn permissive() -> Self {
        ConstraintSet {
            fields: vec![Field {
                name: "n".to_string(),
                kind: FieldKind::Numeric {
                    element: Element::Int { lo: 1, hi: 100 },
                    shape: Shape::Scalar,
                },
            }],
            tolerance: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Numeric { element: Element, shape: Shape },
    Text { len: Length, alphabet: Vec<char> },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Element {
    Int { lo: i64, hi: i64 },
    Float { lo: f64, hi: f64 },
}

/// Layout of a numeric field: one value, one line of values, or one line of
/// values per row.
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Scalar,
    Sequence(Length),
    Grid(Length, Length),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Length {
    Range { lo: u64, hi: u64 },
    /// Taken from the drawn value of an earlier int scalar.
    Ref(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("line {line}: unsupported type `{ty}`")]
    UnsupportedType { line: usize, ty: String },
    #[error("field `{name}` has contradictory bounds {lo}..{hi}")]
    ContradictoryBounds { name: String, lo: String, hi: String },
    #[error("field `{name}` nests deeper than a sequence of sequences")]
    NestingTooDeep { name: String },
    #[error("field `{name}` takes its length from `{target}`, which is not an earlier non-negative int")]
    InvalidLengthRef { name: String, target: String },
    #[error("field `{name}` spans a range too wide to sample")]
    RangeTooWide { name: String },
    #[error("field `{name}` has an empty alphabet")]
    EmptyAlphabet { name: String },
    #[error("field `{name}` is declared twice")]
    DuplicateField { name: String },
    #[error("a single input would hold {cells} values, more than {limit}")]
    TooLarge { cells: u64, limit: u64 },
    #[error("unknown directive `@{0}`")]
    UnknownDirective(String),
    #[error("no input fields could be recognised")]
    Unrecognized,
}

/// Parses a specification into a constraint set.
///
/// Declarations look like `a: int[1..10] -5..5`; prose lines are scanned for
/// bounds such as `1 <= n <= 10^5` and otherwise ignored.
pub fn interpret(text: &str) -> Result<ConstraintSet, SpecError> {
    let mut interpreter = Interpreter::default();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default();
        for statement in line.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                interpreter.statement(line_no + 1, statement)?;
            }
        }
    }
    interpreter.finish()
}

/// `interpret`, falling back to `ConstraintSet::permissive` on any error.
pub fn interpret_or_default(text: &str) -> ConstraintSet {
    match interpret(text) {
        Ok(constraints) => constraints,
        Err(e) => {
            tracing::warn!("Falling back to permissive input constraints: {}", e);
            ConstraintSet::permissive()
        }
    }
}

#[derive(Default)]
struct Interpreter {
    fields: Vec<Field>,
    tolerance: Option<ToleranceMode>,
}

impl Interpreter {
    fn statement(&mut self, line: usize, statement: &str) -> Result<(), SpecError> {
        if let Some(directive) = statement.strip_prefix('@') {
            return self.directive(line, directive);
        }
        if let Some((name, rest)) = statement.split_once(':') {
            let name = name.trim();
            if is_identifier(name) && looks_like_declaration(rest) {
                let field = self.declaration(line, name, rest.trim())?;
                return self.push(field);
            }
        }
        if let Some(field) = prose_bound(statement) {
            if !self.fields.iter().any(|f| f.name == field.name) {
                return self.push(field);
            }
        }
        Ok(())
    }

    fn directive(&mut self, line: usize, directive: &str) -> Result<(), SpecError> {
        let mut words = directive.split_whitespace();
        match words.next() {
            Some("tolerance") => {
                let abs = match words.next() {
                    Some(word) => parse_float(word).ok_or_else(|| SpecError::Syntax {
                        line,
                        msg: format!("`{}` is not a number", word),
                    })?,
                    None => 1e-6,
                };
                let rel = match words.next() {
                    Some(word) => parse_float(word).ok_or_else(|| SpecError::Syntax {
                        line,
                        msg: format!("`{}` is not a number", word),
                    })?,
                    None => abs,
                };
                self.tolerance = Some(ToleranceMode::Numeric { abs, rel });
                Ok(())
            }
            other => Err(SpecError::UnknownDirective(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    fn declaration(&self, line: usize, name: &str, rest: &str) -> Result<Field, SpecError> {
        let ty_end = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        let (ty, mut rest) = rest.split_at(ty_end);

        let mut dims = Vec::new();
        while let Some(inner) = rest.trim_start().strip_prefix('[') {
            let Some((dim, after)) = inner.split_once(']') else {
                return Err(SpecError::Syntax {
                    line,
                    msg: "unclosed `[`".to_string(),
                });
            };
            dims.push(self.length(line, name, dim.trim())?);
            rest = after;
        }
        let rest = rest.trim();

        let kind = match ty {
            "int" | "float" => {
                let element = element(line, name, ty, rest)?;
                let mut dims = dims.into_iter();
                let shape = match (dims.next(), dims.next(), dims.next()) {
                    (None, _, _) => Shape::Scalar,
                    (Some(len), None, _) => Shape::Sequence(len),
                    (Some(rows), Some(cols), None) => Shape::Grid(rows, cols),
                    _ => {
                        return Err(SpecError::NestingTooDeep {
                            name: name.to_string(),
                        });
                    }
                };
                FieldKind::Numeric { element, shape }
            }
            "string" => {
                if dims.len() > 1 {
                    return Err(SpecError::NestingTooDeep {
                        name: name.to_string(),
                    });
                }
                let Some(len) = dims.pop() else {
                    return Err(SpecError::Syntax {
                        line,
                        msg: format!("string `{}` needs a length, e.g. string[1..10]", name),
                    });
                };
                let alphabet = if rest.is_empty() {
                    expand_alphabet(DEFAULT_ALPHABET)
                } else {
                    let quoted = rest
                        .strip_prefix('"')
                        .and_then(|r| r.strip_suffix('"'))
                        .ok_or_else(|| SpecError::Syntax {
                            line,
                            msg: format!("alphabet of `{}` must be quoted", name),
                        })?;
                    expand_alphabet(quoted)
                };
                if alphabet.is_empty() {
                    return Err(SpecError::EmptyAlphabet {
                        name: name.to_string(),
                    });
                }
                FieldKind::Text { len, alphabet }
            }
            _ => {
                return Err(SpecError::UnsupportedType {
                    line,
                    ty: ty.to_string(),
                });
            }
        };

        Ok(Field {
            name: name.to_string(),
            kind,
        })
    }

    fn length(&self, line: usize, name: &str, dim: &str) -> Result<Length, SpecError> {
        if is_identifier(dim) {
            let valid = self.fields.iter().any(|f| {
                f.name == dim
                    && matches!(
                        f.kind,
                        FieldKind::Numeric {
                            element: Element::Int { lo, .. },
                            shape: Shape::Scalar,
                        } if lo >= 0
                    )
            });
            if !valid {
                return Err(SpecError::InvalidLengthRef {
                    name: name.to_string(),
                    target: dim.to_string(),
                });
            }
            return Ok(Length::Ref(dim.to_string()));
        }

        let (lo, hi) = int_range(line, dim)?;
        if lo > hi {
            return Err(SpecError::ContradictoryBounds {
                name: name.to_string(),
                lo: lo.to_string(),
                hi: hi.to_string(),
            });
        }
        if lo < 0 {
            return Err(SpecError::Syntax {
                line,
                msg: format!("length of `{}` cannot be negative", name),
            });
        }
        Ok(Length::Range {
            lo: lo as u64,
            hi: hi as u64,
        })
    }

    fn push(&mut self, field: Field) -> Result<(), SpecError> {
        if self.fields.iter().any(|f| f.name == field.name) {
            return Err(SpecError::DuplicateField { name: field.name });
        }
        self.fields.push(field);
        Ok(())
    }

    fn finish(self) -> Result<ConstraintSet, SpecError> {
        if self.fields.is_empty() {
            return Err(SpecError::Unrecognized);
        }

        let int_maxima: HashMap<&str, u64> = self
            .fields
            .iter()
            .filter_map(|f| match f.kind {
                FieldKind::Numeric {
                    element: Element::Int { hi, .. },
                    shape: Shape::Scalar,
                } => Some((f.name.as_str(), hi.max(0) as u64)),
                _ => None,
            })
            .collect();
        let max_len = |len: &Length| match len {
            Length::Range { hi, .. } => *hi,
            Length::Ref(target) => int_maxima.get(target.as_str()).copied().unwrap_or(0),
        };

        let cells = self.fields.iter().fold(0u64, |total, f| {
            let cells = match &f.kind {
                FieldKind::Numeric { shape, .. } => match shape {
                    Shape::Scalar => 1,
                    Shape::Sequence(len) => max_len(len),
                    Shape::Grid(rows, cols) => max_len(rows).saturating_mul(max_len(cols)),
                },
                FieldKind::Text { len, .. } => max_len(len),
            };
            total.saturating_add(cells)
        });
        if cells > MAX_CELLS {
            return Err(SpecError::TooLarge {
                cells,
                limit: MAX_CELLS,
            });
        }

        Ok(ConstraintSet {
            fields: self.fields,
            tolerance: self.tolerance,
        })
    }
}

fn element(line: usize, name: &str, ty: &str, range: &str) -> Result<Element, SpecError> {
    if ty == "int" {
        let (lo, hi) = int_range(line, range)?;
        if lo > hi {
            return Err(SpecError::ContradictoryBounds {
                name: name.to_string(),
                lo: lo.to_string(),
                hi: hi.to_string(),
            });
        }
        return Ok(Element::Int { lo, hi });
    }

    let (lo, hi) = split_range(line, range)?;
    let (Some(lo), Some(hi)) = (parse_float(lo), parse_float(hi)) else {
        return Err(SpecError::Syntax {
            line,
            msg: format!("`{}` is not a numeric range", range),
        });
    };
    if !(lo <= hi) || !lo.is_finite() || !hi.is_finite() {
        return Err(SpecError::ContradictoryBounds {
            name: name.to_string(),
            lo: lo.to_string(),
            hi: hi.to_string(),
        });
    }
    // Uniform sampling divides the span by a value just under one.
    if !(hi - lo <= f64::MAX / 2.0) {
        return Err(SpecError::RangeTooWide {
            name: name.to_string(),
        });
    }
    Ok(Element::Float { lo, hi })
}

fn split_range(line: usize, range: &str) -> Result<(&str, &str), SpecError> {
    range
        .split_once("..")
        .map(|(lo, hi)| (lo.trim(), hi.trim_start_matches('=').trim()))
        .ok_or_else(|| SpecError::Syntax {
            line,
            msg: format!("expected a range like 1..10, found `{}`", range),
        })
}

fn int_range(line: usize, range: &str) -> Result<(i64, i64), SpecError> {
    let (lo, hi) = split_range(line, range)?;
    match (parse_int(lo), parse_int(hi)) {
        (Some(lo), Some(hi)) => Ok((lo, hi)),
        _ => Err(SpecError::Syntax {
            line,
            msg: format!("`{}` is not an integer range", range),
        }),
    }
}

/// Accepts plain integers, `10^5`, `2*10^5` and `1e5`.
fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (factor, power) = match s.split_once('*') {
        Some((factor, power)) => (factor.trim().parse::<i64>().ok()?, power.trim()),
        None => (1, s),
    };
    let (base, exp) = if let Some((base, exp)) = power.split_once('^') {
        (base.trim().parse::<i64>().ok()?, exp.trim().parse::<u32>().ok()?)
    } else if let Some((mantissa, exp)) = power.split_once(['e', 'E']) {
        let value = mantissa
            .parse::<i64>()
            .ok()?
            .checked_mul(10i64.checked_pow(exp.parse::<u32>().ok()?)?)?;
        return factor
            .checked_mul(value)
            .map(|v| if negative { -v } else { v });
    } else {
        return None;
    };
    let value = factor.checked_mul(base.checked_pow(exp)?)?;
    Some(if negative { -value } else { value })
}

fn parse_float(s: &str) -> Option<f64> {
    let s = s.trim();
    s.parse::<f64>()
        .ok()
        .or_else(|| parse_int(s).map(|v| v as f64))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn looks_like_declaration(rest: &str) -> bool {
    let rest = rest.trim_start();
    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    matches!(word.as_str(), "int" | "float" | "string")
        || (!word.is_empty() && rest[word.len()..].trim_start().starts_with('['))
}

/// Expands `a-z` style ranges; a `-` at either end is literal.
fn expand_alphabet(spec: &str) -> Vec<char> {
    let chars: Vec<char> = spec.chars().collect();
    let mut alphabet = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i] <= chars[i + 2] {
            alphabet.extend(chars[i]..=chars[i + 2]);
            i += 3;
        } else {
            alphabet.push(chars[i]);
            i += 1;
        }
    }
    let mut seen = std::collections::HashSet::new();
    alphabet.retain(|c| !c.is_control() && seen.insert(*c));
    alphabet
}

/// Recognises `LO <= name <= HI` (or with `≤`) inside free text.
fn prose_bound(statement: &str) -> Option<Field> {
    let normalized = statement.replace('≤', "<=");
    let parts: Vec<&str> = normalized.split("<=").collect();
    if parts.len() != 3 {
        return None;
    }
    let punctuation = |c: char| !(c.is_ascii_alphanumeric() || "-+^*_".contains(c));
    let lo = parts[0].split_whitespace().last()?.trim_matches(punctuation);
    let name = parts[1].trim().trim_matches(punctuation);
    let hi = parts[2].split_whitespace().next()?.trim_matches(punctuation);
    let hi = hi.trim_end_matches(|c: char| c == ',' || c == '.');

    if !is_identifier(name) {
        return None;
    }
    let (lo, hi) = (parse_int(lo)?, parse_int(hi)?);
    if lo > hi {
        return None;
    }
    Some(Field {
        name: name.to_string(),
        kind: FieldKind::Numeric {
            element: Element::Int { lo, hi },
            shape: Shape::Scalar,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_scalar(name: &str, lo: i64, hi: i64) -> Field {
        Field {
            name: name.to_string(),
            kind: FieldKind::Numeric {
                element: Element::Int { lo, hi },
                shape: Shape::Scalar,
            },
        }
    }

    #[test]
    fn test_interpret_declarations() {
        let constraints = interpret(
            "n: int 1..10\n\
             a: int[n] -10^3..10^3\n\
             g: int[1..3][2..2] 0..9  # matrix\n\
             s: string[0..5] \"ab\"\n\
             x: float -1.5..1.5",
        )
        .unwrap();

        assert_eq!(constraints.fields.len(), 5);
        assert_eq!(constraints.fields[0], int_scalar("n", 1, 10));
        assert_eq!(
            constraints.fields[1].kind,
            FieldKind::Numeric {
                element: Element::Int { lo: -1000, hi: 1000 },
                shape: Shape::Sequence(Length::Ref("n".to_string())),
            }
        );
        assert_eq!(
            constraints.fields[2].kind,
            FieldKind::Numeric {
                element: Element::Int { lo: 0, hi: 9 },
                shape: Shape::Grid(
                    Length::Range { lo: 1, hi: 3 },
                    Length::Range { lo: 2, hi: 2 }
                ),
            }
        );
        assert_eq!(
            constraints.fields[3].kind,
            FieldKind::Text {
                len: Length::Range { lo: 0, hi: 5 },
                alphabet: vec!['a', 'b'],
            }
        );
        assert_eq!(
            constraints.fields[4].kind,
            FieldKind::Numeric {
                element: Element::Float { lo: -1.5, hi: 1.5 },
                shape: Shape::Scalar,
            }
        );
        assert_eq!(constraints.tolerance, None);
    }

    #[test]
    fn test_semicolon_separated_statements() {
        let constraints = interpret("a: int 1..2; b: int 3..4").unwrap();
        assert_eq!(
            constraints.fields,
            vec![int_scalar("a", 1, 2), int_scalar("b", 3, 4)]
        );
    }

    #[test]
    fn test_prose_bounds() {
        let constraints = interpret(
            "The first line contains N (1 ≤ N ≤ 2*10^5).\n\
             Then Q follows, 1 <= Q <= 1e3.\n\
             Print the answer.",
        )
        .unwrap();
        assert_eq!(
            constraints.fields,
            vec![int_scalar("N", 1, 200_000), int_scalar("Q", 1, 1000)]
        );
    }

    #[test]
    fn test_prose_only_text_is_unrecognized() {
        assert_eq!(
            interpret("Read some numbers and print their sum."),
            Err(SpecError::Unrecognized)
        );
        assert_eq!(interpret(""), Err(SpecError::Unrecognized));
    }

    #[test]
    fn test_tolerance_directive() {
        let constraints = interpret("@tolerance 1e-4\nx: float 0..1").unwrap();
        assert_eq!(
            constraints.tolerance,
            Some(ToleranceMode::Numeric {
                abs: 1e-4,
                rel: 1e-4
            })
        );

        let constraints = interpret("@tolerance 0.5 0.01\nx: float 0..1").unwrap();
        assert_eq!(
            constraints.tolerance,
            Some(ToleranceMode::Numeric { abs: 0.5, rel: 0.01 })
        );

        assert_eq!(
            interpret("@checker exact\nn: int 1..2"),
            Err(SpecError::UnknownDirective("checker".to_string()))
        );
    }

    #[test]
    fn test_contradictory_bounds() {
        assert!(matches!(
            interpret("n: int 10..1"),
            Err(SpecError::ContradictoryBounds { .. })
        ));
        assert!(matches!(
            interpret("a: int[5..2] 0..1"),
            Err(SpecError::ContradictoryBounds { .. })
        ));
        assert!(matches!(
            interpret("x: float 2.0..-2.0"),
            Err(SpecError::ContradictoryBounds { .. })
        ));
    }

    #[test]
    fn test_float_range_must_be_samplable() {
        assert_eq!(
            interpret("x: float -1e308..1e308"),
            Err(SpecError::RangeTooWide {
                name: "x".to_string()
            })
        );
        assert_eq!(
            interpret_or_default("x: float -1e308..1e308"),
            ConstraintSet::permissive()
        );
        assert!(interpret("x: float -1e300..1e300").is_ok());
    }

    #[test]
    fn test_unsupported_shapes() {
        assert!(matches!(
            interpret("t: int[1..2][1..2][1..2] 0..1"),
            Err(SpecError::NestingTooDeep { .. })
        ));
        assert!(matches!(
            interpret("b: bool[1..2]"),
            Err(SpecError::UnsupportedType { .. })
        ));
        assert!(matches!(
            interpret("s: string[1..2] \"\""),
            Err(SpecError::EmptyAlphabet { .. })
        ));
        assert!(matches!(
            interpret("s: string \"ab\""),
            Err(SpecError::Syntax { .. })
        ));
    }

    #[test]
    fn test_length_references_must_be_earlier_non_negative_ints() {
        assert!(matches!(
            interpret("a: int[n] 0..1\nn: int 1..3"),
            Err(SpecError::InvalidLengthRef { .. })
        ));
        assert!(matches!(
            interpret("n: int -3..3\na: int[n] 0..1"),
            Err(SpecError::InvalidLengthRef { .. })
        ));
        assert!(matches!(
            interpret("n: float 0..3\na: int[n] 0..1"),
            Err(SpecError::InvalidLengthRef { .. })
        ));
    }

    #[test]
    fn test_duplicate_fields() {
        assert_eq!(
            interpret("n: int 1..2\nn: int 1..3"),
            Err(SpecError::DuplicateField {
                name: "n".to_string()
            })
        );
    }

    #[test]
    fn test_oversized_inputs_are_rejected() {
        assert!(matches!(
            interpret("g: int[1..10^4][1..10^4] 0..1"),
            Err(SpecError::TooLarge { .. })
        ));
        assert!(matches!(
            interpret("n: int 0..10^9\na: int[n] 0..1"),
            Err(SpecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_fallback_to_permissive_defaults() {
        assert_eq!(interpret_or_default("n: int 9..1"), ConstraintSet::permissive());
        assert_eq!(
            interpret_or_default("whatever the problem says"),
            ConstraintSet::permissive()
        );
        assert_eq!(
            interpret_or_default("k: int 2..3").fields,
            vec![int_scalar("k", 2, 3)]
        );
    }

    #[test]
    fn test_expand_alphabet() {
        assert_eq!(expand_alphabet("a-c"), vec!['a', 'b', 'c']);
        assert_eq!(expand_alphabet("-ab-"), vec!['-', 'a', 'b']);
        assert_eq!(expand_alphabet("aab"), vec!['a', 'b']);
        assert_eq!(expand_alphabet("0-2x"), vec!['0', '1', '2', 'x']);
    }

    #[test]
    fn test_parse_int_forms() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int("10^5"), Some(100_000));
        assert_eq!(parse_int("-10^9"), Some(-1_000_000_000));
        assert_eq!(parse_int("2*10^5"), Some(200_000));
        assert_eq!(parse_int("1e3"), Some(1000));
        assert_eq!(parse_int("10^100"), None);
        assert_eq!(parse_int("ten"), None);
    }
}
