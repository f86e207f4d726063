//! Compiled filter files.
//!
//! A filter file is a stream of whitespace-separated integers:
//!
//! ```text
//! <type> <num_ops>
//! <direction> <slot>        (num_ops times; direction 0 = start, 1 = end)
//! <num_functions> <function>...
//! <num_unsafe_back_edges> <edge>...
//! <num_unsafe_call_sites> <call site>...
//! ```
//!
//! The three trailing sections may be omitted from the end of the file; a
//! missing section is empty.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    CriticalRegion,
    Order,
    Atomic,
    Barrier,
}

impl FilterType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(FilterType::CriticalRegion),
            2 => Some(FilterType::Order),
            3 => Some(FilterType::Atomic),
            4 => Some(FilterType::Barrier),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            FilterType::CriticalRegion => 1,
            FilterType::Order => 2,
            FilterType::Atomic => 3,
            FilterType::Barrier => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FilterType::CriticalRegion => "critical_region",
            FilterType::Order => "order",
            FilterType::Atomic => "atomic",
            FilterType::Barrier => "barrier",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    pub direction: Direction,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub kind: FilterType,
    pub ops: Vec<OpSpec>,
    pub functions_to_patch: Vec<u32>,
    pub unsafe_back_edges: Vec<u32>,
    pub unsafe_call_sites: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("unexpected end of filter, expected {0}")]
    UnexpectedEof(&'static str),
    #[error("invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("unknown filter type {0}")]
    UnknownType(i64),
    #[error("invalid direction {0}, expected 0 (start) or 1 (end)")]
    InvalidDirection(i64),
    #[error("trailing data after filter: {0:?}")]
    TrailingData(String),
}

/// Table sizes a filter is checked against before install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_slots: u32,
    pub max_back_edges: u32,
    pub max_call_sites: u32,
    pub max_functions: u32,
}

struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next_raw(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    fn int(&mut self, what: &'static str) -> Result<i64, FilterParseError> {
        let token = self
            .next_raw()
            .ok_or(FilterParseError::UnexpectedEof(what))?;
        token
            .parse()
            .map_err(|_| FilterParseError::InvalidInteger(token.to_string()))
    }

    fn id(&mut self, what: &'static str) -> Result<u32, FilterParseError> {
        let value = self.int(what)?;
        u32::try_from(value).map_err(|_| FilterParseError::InvalidInteger(value.to_string()))
    }

    /// A counted id list, empty when the input ends before the count.
    fn optional_list(&mut self, what: &'static str) -> Result<Vec<u32>, FilterParseError> {
        let Some(token) = self.next_raw() else {
            return Ok(Vec::new());
        };
        let count: u32 = token
            .parse()
            .map_err(|_| FilterParseError::InvalidInteger(token.to_string()))?;
        (0..count).map(|_| self.id(what)).collect()
    }
}

impl FilterSpec {
    pub fn parse(text: &str) -> Result<Self, FilterParseError> {
        let mut tokens = Tokens {
            inner: text.split_whitespace(),
        };

        let code = tokens.int("filter type")?;
        let kind = FilterType::from_code(code).ok_or(FilterParseError::UnknownType(code))?;

        let num_ops = tokens.id("operation count")?;
        let mut ops = Vec::with_capacity(num_ops.min(1024) as usize);
        for _ in 0..num_ops {
            let direction = match tokens.int("operation direction")? {
                0 => Direction::Start,
                1 => Direction::End,
                other => return Err(FilterParseError::InvalidDirection(other)),
            };
            let slot = tokens.id("operation slot")?;
            ops.push(OpSpec { direction, slot });
        }

        let functions_to_patch = tokens.optional_list("function id")?;
        let unsafe_back_edges = tokens.optional_list("back edge id")?;
        let unsafe_call_sites = tokens.optional_list("call site id")?;

        if let Some(extra) = tokens.next_raw() {
            return Err(FilterParseError::TrailingData(extra.to_string()));
        }

        Ok(Self {
            kind,
            ops,
            functions_to_patch,
            unsafe_back_edges,
            unsafe_call_sites,
        })
    }

    /// Read and parse a filter file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text)?)
    }

    /// Check every id against the engine's table sizes.
    pub fn validate(&self, limits: &Limits) -> Result<(), EngineError> {
        fn check(ids: &[u32], max: u32, what: &str) -> Result<(), EngineError> {
            match ids.iter().find(|&&id| id >= max) {
                Some(id) => Err(EngineError::MalformedFilter(format!(
                    "{} {} out of range (max {})",
                    what, id, max
                ))),
                None => Ok(()),
            }
        }

        let slots: Vec<u32> = self.ops.iter().map(|op| op.slot).collect();
        check(&slots, limits.max_slots, "slot")?;
        check(&self.functions_to_patch, limits.max_functions, "function")?;
        check(&self.unsafe_back_edges, limits.max_back_edges, "back edge")?;
        check(&self.unsafe_call_sites, limits.max_call_sites, "call site")?;
        Ok(())
    }
}

impl FromStr for FilterSpec {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Renders the canonical file form.
impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.kind.code(), self.ops.len())?;
        for op in &self.ops {
            let dir = match op.direction {
                Direction::Start => 0,
                Direction::End => 1,
            };
            writeln!(f, "{} {}", dir, op.slot)?;
        }
        for list in [
            &self.functions_to_patch,
            &self.unsafe_back_edges,
            &self.unsafe_call_sites,
        ] {
            write!(f, "{}", list.len())?;
            for id in list {
                write!(f, " {}", id)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
