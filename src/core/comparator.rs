use std::fmt;
use std::str::FromStr;

use itertools::{EitherOrBoth, Itertools};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ToleranceMode {
    /// Canonicalized outputs must be identical.
    #[default]
    Exact,
    /// Token-wise comparison; numeric tokens may differ by `abs` or by
    /// `rel` times the reference value.
    Numeric { abs: f64, rel: f64 },
}

impl FromStr for ToleranceMode {
    type Err = String;

    /// `exact`, or `abs=<f64>,rel=<f64>` with either key optional.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("exact") {
            return Ok(ToleranceMode::Exact);
        }

        let (mut abs, mut rel) = (0.0, 0.0);
        for part in s.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, found `{}`", part))?;
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| format!("`{}` is not a number", value.trim()))?;
            if !(value >= 0.0 && value.is_finite()) {
                return Err(format!("tolerance `{}` must be a non-negative number", value));
            }
            match key.trim() {
                "abs" => abs = value,
                "rel" => rel = value,
                other => return Err(format!("unknown tolerance key `{}`", other)),
            }
        }
        Ok(ToleranceMode::Numeric { abs, rel })
    }
}

/// First line on which two canonicalized outputs disagree (1-based).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Difference {
    pub line: usize,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: expected {:?}, got {:?}",
            self.line,
            self.expected.as_deref().unwrap_or("<end of output>"),
            self.actual.as_deref().unwrap_or("<end of output>")
        )
    }
}

/// Normalizes line endings, trims trailing whitespace on every line and drops
/// trailing blank lines.
pub fn canonicalize(output: &str) -> String {
    let normalized = output.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = normalized.split('\n').map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Comparator {
    mode: ToleranceMode,
}

impl Comparator {
    pub fn new(mode: ToleranceMode) -> Self {
        Comparator { mode }
    }

    /// `true` when the two raw outputs agree after canonicalization.
    pub fn compare(&self, expected: &str, actual: &str) -> bool {
        self.first_difference(expected, actual).is_none()
    }

    pub fn first_difference(&self, expected: &str, actual: &str) -> Option<Difference> {
        if expected == actual {
            return None;
        }
        let expected = canonicalize(expected);
        let actual = canonicalize(actual);

        expected
            .split('\n')
            .zip_longest(actual.split('\n'))
            .enumerate()
            .find_map(|(idx, pair)| match pair {
                EitherOrBoth::Both(e, a) if self.lines_match(e, a) => None,
                EitherOrBoth::Both(e, a) => Some(Difference {
                    line: idx + 1,
                    expected: Some(e.to_string()),
                    actual: Some(a.to_string()),
                }),
                EitherOrBoth::Left(e) => Some(Difference {
                    line: idx + 1,
                    expected: Some(e.to_string()),
                    actual: None,
                }),
                EitherOrBoth::Right(a) => Some(Difference {
                    line: idx + 1,
                    expected: None,
                    actual: Some(a.to_string()),
                }),
            })
    }

    fn lines_match(&self, expected: &str, actual: &str) -> bool {
        match self.mode {
            ToleranceMode::Exact => expected == actual,
            ToleranceMode::Numeric { abs, rel } => expected
                .split_whitespace()
                .zip_longest(actual.split_whitespace())
                .all(|pair| match pair {
                    EitherOrBoth::Both(e, a) => e == a || numbers_close(e, a, abs, rel),
                    _ => false,
                }),
        }
    }
}

fn numbers_close(expected: &str, actual: &str, abs: f64, rel: f64) -> bool {
    let (Some(e), Some(a)) = (parse_number(expected), parse_number(actual)) else {
        return false;
    };
    let diff = (e - a).abs();
    diff <= abs || diff <= rel * e.abs()
}

fn parse_number(token: &str) -> Option<f64> {
    if !token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        return None;
    }
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
