//! Control-line bindings shared by the serial and parallel transports.
//!
//! A line-based radio interface wires three logical roles to physical
//! port lines:
//!
//! | role      | direction | serial default | parallel default |
//! |-----------|-----------|----------------|------------------|
//! | `ptt`     | output    | `rts`          | `data`           |
//! | `carrier` | input     | `dcd`          | `busy`           |
//! | `power`   | output    | `dtr`          | `strobe`         |
//!
//! Each transport defines its line vocabulary by implementing
//! [`PhysicalLine`] and drives the hardware through [`LineDriver`].

use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Logical role of a control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineRole {
    Ptt,
    Carrier,
    Power,
}

impl LineRole {
    /// Roles in configuration order.
    pub const ALL: [LineRole; 3] = [LineRole::Ptt, LineRole::Carrier, LineRole::Power];

    pub fn is_output(self) -> bool {
        !matches!(self, LineRole::Carrier)
    }

    pub fn name(self) -> &'static str {
        match self {
            LineRole::Ptt => "ptt",
            LineRole::Carrier => "carrier",
            LineRole::Power => "power",
        }
    }
}

impl fmt::Display for LineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transport's vocabulary of named control lines.
pub trait PhysicalLine: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Default line names for `ptt`, `carrier` and `power`.
    const DEFAULTS: [&'static str; 3];

    /// Resolve the name of a line that can be driven.
    fn output(name: &str) -> Option<Self>;

    /// Resolve the name of a line that can be sensed.
    fn input(name: &str) -> Option<Self>;
}

/// A physical line with its polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundLine<L> {
    pub line: L,
    pub inverted: bool,
}

impl<L> BoundLine<L> {
    /// Electrical level for a logical state, or the logical state for an
    /// electrical level; inversion is its own inverse.
    pub fn translate(&self, state: bool) -> bool {
        state != self.inverted
    }
}

/// Role-to-line map for one transport, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBinding<L> {
    ptt: Option<BoundLine<L>>,
    carrier: Option<BoundLine<L>>,
    power: Option<BoundLine<L>>,
}

impl<L: PhysicalLine> LineBinding<L> {
    /// The transport's default wiring.
    pub fn defaults() -> Result<Self> {
        Self::parse(&L::DEFAULTS)
    }

    /// Build a binding from up to three names in role order.
    ///
    /// An empty list selects the defaults. A missing or empty name leaves
    /// the role unbound. A leading `-` inverts the line. Binding one
    /// physical line to two roles is rejected.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Self::defaults();
        }
        if names.len() > LineRole::ALL.len() {
            return Err(Error::InvalidParameter(format!(
                "expected at most 3 lines (ptt, carrier, power), got {}",
                names.len()
            )));
        }
        let mut binding = LineBinding {
            ptt: None,
            carrier: None,
            power: None,
        };
        let mut used: Vec<L> = Vec::new();
        for (role, raw) in LineRole::ALL.iter().zip(names) {
            let raw = raw.as_ref().trim();
            let (name, inverted) = match raw.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (raw, false),
            };
            if name.is_empty() {
                continue;
            }
            let line = if role.is_output() {
                L::output(name)
            } else {
                L::input(name)
            }
            .ok_or_else(|| {
                Error::InvalidParameter(format!("unknown {role} line: {raw}"))
            })?;
            if used.contains(&line) {
                return Err(Error::InvalidParameter(format!("line already used: {name}")));
            }
            used.push(line);
            let bound = Some(BoundLine { line, inverted });
            match role {
                LineRole::Ptt => binding.ptt = bound,
                LineRole::Carrier => binding.carrier = bound,
                LineRole::Power => binding.power = bound,
            }
        }
        Ok(binding)
    }

    pub fn get(&self, role: LineRole) -> Option<BoundLine<L>> {
        match role {
            LineRole::Ptt => self.ptt,
            LineRole::Carrier => self.carrier,
            LineRole::Power => self.power,
        }
    }
}

/// Raw access to a port's control lines.
///
/// Implemented once per transport; [`LineBinding`] decides which line a
/// role maps to.
#[async_trait]
pub trait LineDriver: Send + Sync {
    type Line: PhysicalLine;

    /// Drive an output line to an electrical level.
    async fn set_line(&mut self, line: Self::Line, level: bool) -> Result<()>;

    /// Sense an input line's electrical level.
    async fn get_line(&mut self, line: Self::Line) -> Result<bool>;

    /// Release the port.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestLine {
        Rts,
        Dtr,
        Cd,
    }

    impl fmt::Display for TestLine {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl PhysicalLine for TestLine {
        const DEFAULTS: [&'static str; 3] = ["rts", "dcd", "dtr"];

        fn output(name: &str) -> Option<Self> {
            match name {
                "rts" => Some(TestLine::Rts),
                "dtr" => Some(TestLine::Dtr),
                _ => None,
            }
        }

        fn input(name: &str) -> Option<Self> {
            match name {
                "dcd" | "cd" => Some(TestLine::Cd),
                _ => None,
            }
        }
    }

    #[test]
    fn defaults_when_empty() {
        let binding = LineBinding::<TestLine>::parse::<&str>(&[]).unwrap();
        assert_eq!(binding.get(LineRole::Ptt).unwrap().line, TestLine::Rts);
        assert_eq!(binding.get(LineRole::Carrier).unwrap().line, TestLine::Cd);
        assert_eq!(binding.get(LineRole::Power).unwrap().line, TestLine::Dtr);
    }

    #[test]
    fn negation_and_unbound_roles() {
        let binding = LineBinding::<TestLine>::parse(&["-dtr", ""]).unwrap();
        let ptt = binding.get(LineRole::Ptt).unwrap();
        assert_eq!(ptt.line, TestLine::Dtr);
        assert!(ptt.inverted);
        assert!(!ptt.translate(true));
        assert!(ptt.translate(false));
        assert!(binding.get(LineRole::Carrier).is_none());
        assert!(binding.get(LineRole::Power).is_none());
    }

    #[test]
    fn same_line_twice_is_rejected() {
        let e = LineBinding::<TestLine>::parse(&["rts", "cd", "-rts"]).unwrap_err();
        assert!(e.to_string().contains("line already used"));
    }

    #[test]
    fn wrong_direction_is_rejected() {
        assert!(LineBinding::<TestLine>::parse(&["cd"]).is_err());
        assert!(LineBinding::<TestLine>::parse(&["rts", "dtr"]).is_err());
    }

    #[test]
    fn too_many_lines_rejected() {
        assert!(LineBinding::<TestLine>::parse(&["rts", "cd", "dtr", "rts"]).is_err());
    }
}
