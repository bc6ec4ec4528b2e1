use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::domain::TestCase;
use crate::core::spec::{ConstraintSet, Element, FieldKind, Length, Shape};

/// Number of leading draws reserved for boundary shapes.
pub const BOUNDARY_DRAWS: u64 = 5;

/// How a draw picks lengths and values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    /// Shortest lengths, smallest values.
    Minimal,
    /// Longest lengths, largest values (strings cycle their alphabet).
    Maximal,
    ShortHigh,
    LongLow,
    /// Shortest lengths, one random value repeated.
    Flat,
    Uniform,
}

impl Profile {
    pub fn for_index(index: u64) -> Self {
        match index {
            0 => Profile::Minimal,
            1 => Profile::Maximal,
            2 => Profile::ShortHigh,
            3 => Profile::LongLow,
            4 => Profile::Flat,
            _ => Profile::Uniform,
        }
    }
}

/// Infinite, restartable sequence of test cases. Every draw depends only on
/// the run seed and the draw index.
#[derive(Clone, Debug)]
pub struct CaseGenerator {
    constraints: Arc<ConstraintSet>,
    seed: u64,
    next_index: u64,
}

pub fn generate(constraints: ConstraintSet, seed: u64) -> CaseGenerator {
    CaseGenerator::new(Arc::new(constraints), seed)
}

impl CaseGenerator {
    pub fn new(constraints: Arc<ConstraintSet>, seed: u64) -> Self {
        CaseGenerator {
            constraints,
            seed,
            next_index: 0,
        }
    }

    pub fn case_at(&self, index: u64) -> TestCase {
        let seed = draw_seed(self.seed, index);
        TestCase {
            index,
            seed,
            input: render(&self.constraints, Profile::for_index(index), seed),
        }
    }
}

impl Iterator for CaseGenerator {
    type Item = TestCase;

    fn next(&mut self) -> Option<TestCase> {
        let case = self.case_at(self.next_index);
        self.next_index += 1;
        Some(case)
    }
}

/// splitmix64 finalizer over the run seed and draw index.
fn draw_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed ^ index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Renders one input: every field on its own line, grids one row per line.
pub fn render(constraints: &ConstraintSet, profile: Profile, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut drawn: HashMap<&str, i64> = HashMap::new();
    let mut out = String::new();

    for field in &constraints.fields {
        match &field.kind {
            FieldKind::Numeric { element, shape } => match shape {
                Shape::Scalar => {
                    let value = draw_value(element, profile, &mut rng, None);
                    if let Value::Int(v) = value {
                        drawn.insert(field.name.as_str(), v);
                    }
                    let _ = writeln!(out, "{}", value);
                }
                Shape::Sequence(len) => {
                    let len = draw_len(len, profile, &mut rng, &drawn);
                    write_row(&mut out, element, len, profile, &mut rng);
                }
                Shape::Grid(rows, cols) => {
                    let rows = draw_len(rows, profile, &mut rng, &drawn);
                    let cols = draw_len(cols, profile, &mut rng, &drawn);
                    for _ in 0..rows {
                        write_row(&mut out, element, cols, profile, &mut rng);
                    }
                }
            },
            FieldKind::Text { len, alphabet } => {
                let len = draw_len(len, profile, &mut rng, &drawn) as usize;
                let flat = alphabet[rng.gen_range(0..alphabet.len())];
                let text: String = (0..len)
                    .map(|i| match profile {
                        Profile::Minimal | Profile::LongLow => alphabet[0],
                        Profile::Maximal => alphabet[i % alphabet.len()],
                        Profile::ShortHigh => alphabet[alphabet.len() - 1],
                        Profile::Flat => flat,
                        Profile::Uniform => alphabet[rng.gen_range(0..alphabet.len())],
                    })
                    .collect();
                out.push_str(&text);
                out.push('\n');
            }
        }
    }

    out
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:.6}", v),
        }
    }
}

fn write_row(out: &mut String, element: &Element, len: u64, profile: Profile, rng: &mut StdRng) {
    let flat = draw_value(element, Profile::Uniform, rng, None);
    for i in 0..len {
        if i > 0 {
            out.push(' ');
        }
        let value = draw_value(element, profile, rng, Some(flat));
        let _ = write!(out, "{}", value);
    }
    out.push('\n');
}

fn draw_value(element: &Element, profile: Profile, rng: &mut StdRng, flat: Option<Value>) -> Value {
    if let (Profile::Flat, Some(value)) = (profile, flat) {
        return value;
    }
    match (element, profile) {
        (Element::Int { lo, .. }, Profile::Minimal | Profile::LongLow) => Value::Int(*lo),
        (Element::Int { hi, .. }, Profile::Maximal | Profile::ShortHigh) => Value::Int(*hi),
        (Element::Int { lo, hi }, _) => Value::Int(rng.gen_range(*lo..=*hi)),
        (Element::Float { lo, .. }, Profile::Minimal | Profile::LongLow) => Value::Float(*lo),
        (Element::Float { hi, .. }, Profile::Maximal | Profile::ShortHigh) => Value::Float(*hi),
        (Element::Float { lo, hi }, _) if lo == hi => Value::Float(*lo),
        (Element::Float { lo, hi }, _) => Value::Float(rng.gen_range(*lo..=*hi)),
    }
}

/// Uniform draws still land on an endpoint a quarter of the time.
fn draw_len(len: &Length, profile: Profile, rng: &mut StdRng, drawn: &HashMap<&str, i64>) -> u64 {
    match len {
        Length::Ref(target) => drawn.get(target.as_str()).copied().unwrap_or(0).max(0) as u64,
        Length::Range { lo, hi } => match profile {
            Profile::Minimal | Profile::ShortHigh | Profile::Flat => *lo,
            Profile::Maximal | Profile::LongLow => *hi,
            Profile::Uniform => {
                if rng.gen_bool(0.25) {
                    if rng.gen_bool(0.5) { *lo } else { *hi }
                } else {
                    rng.gen_range(*lo..=*hi)
                }
            }
        },
    }
}
