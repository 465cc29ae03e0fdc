//! Natural ordering: digit runs compare as integers, everything else case-insensitively.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

/// Unicode decimal digits (`Nd`), not only ASCII.
static DIGIT_RUN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\d+").expect("digit run regex should compile"));

/// One run of a split name.
#[derive(Debug, PartialEq, Eq)]
enum Run {
  Text(String),
  /// Digit values rewritten as ASCII.
  Digits(String),
}

fn is_digit(c: char) -> bool {
  let mut buf = [0u8; 4];
  DIGIT_RUN.is_match(c.encode_utf8(&mut buf))
}

/// Value of a decimal digit. Every block of `Nd` characters runs 0 to 9 in
/// code point order, so the value is the offset from the start of the block.
fn digit_value(c: char) -> u32 {
  if let Some(value) = c.to_digit(10) {
    return value;
  }
  let mut first = c as u32;
  while let Some(prev) = first.checked_sub(1).and_then(char::from_u32) {
    if !is_digit(prev) {
      break;
    }
    first -= 1;
  }
  (c as u32 - first) % 10
}

/// Split into alternating text/digit runs, always starting with a (possibly empty) text run.
fn runs(s: &str) -> Vec<Run> {
  let mut out = Vec::new();
  let mut last = 0;

  for m in DIGIT_RUN.find_iter(s) {
    out.push(Run::Text(s[last..m.start()].to_lowercase()));
    let digits = m
      .as_str()
      .chars()
      .filter_map(|c| char::from_digit(digit_value(c), 10))
      .collect();
    out.push(Run::Digits(digits));
    last = m.end();
  }
  if last < s.len() || out.is_empty() {
    out.push(Run::Text(s[last..].to_lowercase()));
  }
  out
}

/// Compare two digit strings by numeric value without overflow.
fn cmp_digits(a: &str, b: &str) -> Ordering {
  let a = a.trim_start_matches('0');
  let b = b.trim_start_matches('0');
  a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Natural comparison of two names.
///
/// Names whose keys are equal (`a01` vs `a1`, `A` vs `a`) fall back to plain
/// byte order so the result is total and deterministic.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
  let ra = runs(a);
  let rb = runs(b);

  for (x, y) in ra.iter().zip(rb.iter()) {
    let ord = match (x, y) {
      (Run::Digits(x), Run::Digits(y)) => cmp_digits(x, y),
      (Run::Text(x), Run::Text(y)) => x.cmp(y),
      // Runs alternate from a text run, so positions always agree in kind.
      (Run::Text(_), Run::Digits(_)) => Ordering::Less,
      (Run::Digits(_), Run::Text(_)) => Ordering::Greater,
    };
    if ord != Ordering::Equal {
      return ord;
    }
  }

  ra.len().cmp(&rb.len()).then_with(|| a.cmp(b))
}
