//! Plain-text restart/trajectory record.
//!
//! One block per iteration:
//!
//! ```text
//! Iteration 7
//! L1 norm of solution: <l1> RMS Error: <rms> Objective fn: <obj> Number of vars: <n>
//! <count>
//! <index> <value>
//! Exclude
//! <count>
//! <index> 1
//! Mu
//! <count>
//! <index> <value>
//! ```
//!
//! `Exclude` and `Mu` are optional. Blocks are read until end of input and the
//! last complete block describes the state to restart from.

use core::fmt;
use std::io::{self, BufRead, Write};

/// Token position of the objective value on the error line.
const OBJECTIVE_TOKEN: usize = 10;
const ERROR_LINE_TOKENS: usize = 15;

/// Solver state captured at the start of an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Iteration about to run with this state.
    pub iteration: usize,
    pub l1_norm: f64,
    pub rms_error: f64,
    pub objective: f64,
    pub nactive: usize,
    /// Nonzero coefficients as `(index, value)`.
    pub coefficients: Vec<(usize, f64)>,
    pub exclude: Option<Vec<usize>>,
    /// Nonzero predictions as `(row, value)`.
    pub mu: Option<Vec<(usize, f64)>>,
}

/// What went wrong while reading a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointErrorKind {
    /// A block did not start with `Iteration <n>`.
    MissingIteration { found: String },
    /// The error summary line had too few tokens.
    MalformedErrorLine { tokens: usize },
    /// A token could not be parsed as a number.
    InvalidNumber { token: String },
    /// Input ended inside a block, or contained no block at all.
    UnexpectedEof,
    /// An index does not fit the problem being restarted.
    IndexOutOfRange { index: usize, len: usize },
    /// A nonzero coefficient is also listed as excluded.
    ExcludedCoefficient { index: usize },
    /// The underlying reader failed.
    Io(String),
}

/// Checkpoint parse or replay failure; `line` is 1-based, 0 when not tied to input.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointError {
    pub line: usize,
    pub kind: CheckpointErrorKind,
}

impl CheckpointError {
    pub(crate) fn out_of_range(index: usize, len: usize) -> Self {
        Self {
            line: 0,
            kind: CheckpointErrorKind::IndexOutOfRange { index, len },
        }
    }

    pub(crate) fn excluded_coefficient(index: usize) -> Self {
        Self {
            line: 0,
            kind: CheckpointErrorKind::ExcludedCoefficient { index },
        }
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "checkpoint line {}: ", self.line)?;
        } else {
            write!(f, "checkpoint: ")?;
        }
        match &self.kind {
            CheckpointErrorKind::MissingIteration { found } => {
                write!(f, "expected 'Iteration <n>', found '{found}'")
            }
            CheckpointErrorKind::MalformedErrorLine { tokens } => {
                write!(
                    f,
                    "error summary has {tokens} tokens, expected {ERROR_LINE_TOKENS}"
                )
            }
            CheckpointErrorKind::InvalidNumber { token } => write!(f, "invalid number '{token}'"),
            CheckpointErrorKind::UnexpectedEof => write!(f, "unexpected end of data"),
            CheckpointErrorKind::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            CheckpointErrorKind::ExcludedCoefficient { index } => {
                write!(f, "index {index} has a nonzero coefficient but is excluded")
            }
            CheckpointErrorKind::Io(msg) => write!(f, "read failed: {msg}"),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Iteration {}", self.iteration)?;
        writeln!(
            f,
            "L1 norm of solution: {:.16e} RMS Error: {:.16e} Objective fn: {:.16e} Number of vars: {}",
            self.l1_norm, self.rms_error, self.objective, self.nactive
        )?;
        write_sparse(f, &self.coefficients)?;
        if let Some(exclude) = &self.exclude {
            writeln!(f, "Exclude")?;
            writeln!(f, "{}", exclude.len())?;
            for j in exclude {
                writeln!(f, "{j} 1")?;
            }
        }
        if let Some(mu) = &self.mu {
            writeln!(f, "Mu")?;
            write_sparse(f, mu)?;
        }
        Ok(())
    }
}

fn write_sparse(f: &mut fmt::Formatter<'_>, entries: &[(usize, f64)]) -> fmt::Result {
    writeln!(f, "{}", entries.len())?;
    for (j, v) in entries {
        writeln!(f, "{j} {v:.16e}")?;
    }
    Ok(())
}

impl Checkpoint {
    /// Append this block to `out`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{self}")
    }

    /// Read every block until end of input.
    pub fn read_all<R: BufRead>(reader: R) -> Result<Vec<Self>, CheckpointError> {
        let mut lines = Lines::new(reader);
        let mut blocks = Vec::new();
        while let Some(first) = lines.next()? {
            blocks.push(parse_block(&mut lines, &first)?);
        }
        Ok(blocks)
    }

    /// Read all blocks and keep the last.
    pub fn read_last<R: BufRead>(reader: R) -> Result<Self, CheckpointError> {
        Self::read_all(reader)?.pop().ok_or(CheckpointError {
            line: 0,
            kind: CheckpointErrorKind::UnexpectedEof,
        })
    }

    /// Parse the last block of an in-memory record.
    pub fn parse_last(text: &str) -> Result<Self, CheckpointError> {
        Self::read_last(text.as_bytes())
    }
}

/// Non-empty lines with 1-based numbering and one line of look-ahead.
struct Lines<R> {
    reader: R,
    line: usize,
    peeked: Option<String>,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            peeked: None,
        }
    }

    fn next(&mut self) -> Result<Option<String>, CheckpointError> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        loop {
            let mut buf = String::new();
            let read = self.reader.read_line(&mut buf).map_err(|err| CheckpointError {
                line: self.line + 1,
                kind: CheckpointErrorKind::Io(err.to_string()),
            })?;
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;
            let trimmed = buf.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    fn peek(&mut self) -> Result<Option<&str>, CheckpointError> {
        if self.peeked.is_none() {
            self.peeked = self.next()?;
        }
        Ok(self.peeked.as_deref())
    }

    fn require(&mut self) -> Result<String, CheckpointError> {
        self.next()?.ok_or_else(|| self.error(CheckpointErrorKind::UnexpectedEof))
    }

    fn error(&self, kind: CheckpointErrorKind) -> CheckpointError {
        CheckpointError {
            line: self.line,
            kind,
        }
    }

    fn number<T: core::str::FromStr>(&self, token: &str) -> Result<T, CheckpointError> {
        token.parse().map_err(|_| {
            self.error(CheckpointErrorKind::InvalidNumber {
                token: token.to_string(),
            })
        })
    }

    fn sparse<T: core::str::FromStr>(&mut self) -> Result<Vec<(usize, T)>, CheckpointError> {
        let header = self.require()?;
        let count: usize = self.number(&header)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let line = self.require()?;
            let mut tokens = line.split_whitespace();
            let (Some(index), Some(value)) = (tokens.next(), tokens.next()) else {
                return Err(self.error(CheckpointErrorKind::InvalidNumber { token: line }));
            };
            entries.push((self.number(index)?, self.number(value)?));
        }
        Ok(entries)
    }
}

fn parse_block<R: BufRead>(
    lines: &mut Lines<R>,
    first: &str,
) -> Result<Checkpoint, CheckpointError> {
    let mut tokens = first.split_whitespace();
    let iteration = match (tokens.next(), tokens.next()) {
        (Some("Iteration"), Some(n)) => lines.number(n)?,
        _ => {
            return Err(lines.error(CheckpointErrorKind::MissingIteration {
                found: first.to_string(),
            }));
        }
    };

    let summary = lines.require()?;
    let tokens: Vec<&str> = summary.split_whitespace().collect();
    if tokens.len() < ERROR_LINE_TOKENS {
        return Err(lines.error(CheckpointErrorKind::MalformedErrorLine {
            tokens: tokens.len(),
        }));
    }
    let l1_norm = lines.number(tokens[4])?;
    let rms_error = lines.number(tokens[7])?;
    let objective = lines.number(tokens[OBJECTIVE_TOKEN])?;
    let nactive = lines.number(tokens[14])?;

    let coefficients = lines.sparse::<f64>()?;

    let mut exclude = None;
    if lines.peek()? == Some("Exclude") {
        lines.next()?;
        let flags = lines.sparse::<i64>()?;
        exclude = Some(
            flags
                .into_iter()
                .filter(|&(_, flag)| flag != 0)
                .map(|(j, _)| j)
                .collect(),
        );
    }

    let mut mu = None;
    if lines.peek()? == Some("Mu") {
        lines.next()?;
        mu = Some(lines.sparse::<f64>()?);
    }

    Ok(Checkpoint {
        iteration,
        l1_norm,
        rms_error,
        objective,
        nactive,
        coefficients,
        exclude,
        mu,
    })
}
