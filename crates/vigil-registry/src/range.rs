use std::fmt;
use std::str::FromStr;

use vigil_core::RegistryError;

/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, RegistryError> {
        if start == 0 || start > end {
            return Err(RegistryError::InvalidRange(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = RegistryError;

    /// `5801-6000`, or a single port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidRange(s.to_string());
        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (s.trim(), s.trim()),
        };
        let start = start.parse().map_err(|_| invalid())?;
        let end = end.parse().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}
