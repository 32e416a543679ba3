use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CodeError;

/// Program version. Follows [semantic versioning](https://semver.org)
/// without pre-release or build metadata; peers compare and route by it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let invalid = || CodeError::bad_request(format!("invalid version '{s}'"));
        let mut parts = s.splitn(3, '.');
        let mut next = |required: bool| -> Result<u32, CodeError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open version interval `[min, max)`. Either side may be absent,
/// which leaves that side unbounded. The wire form is `min,max` with
/// either side empty; a bare version is a lower bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Option<Version>,
    pub max: Option<Version>,
}

impl VersionRange {
    pub fn contains(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            if version < min {
                return false;
            }
        }
        if let Some(max) = &self.max {
            if version >= max {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(min) = &self.min {
            write!(f, "{min}")?;
        }
        write!(f, ",")?;
        if let Some(max) = &self.max {
            write!(f, "{max}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionRange {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (min, max) = match s.split_once(',') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (s, ""),
        };
        let parse = |part: &str| -> Result<Option<Version>, CodeError> {
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse().map(Some)
            }
        };
        Ok(Self {
            min: parse(min)?,
            max: parse(max)?,
        })
    }
}

/// Per-service version constraints a request carries. The single-range
/// header form (`min,max`) binds whichever service the request targets and
/// is stored under the wildcard entry; the explicit form is
/// `svc=min,max;other=min,max`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedVersions(BTreeMap<String, VersionRange>);

impl AcceptedVersions {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, service: impl Into<String>, range: VersionRange) {
        self.0.insert(service.into(), range);
    }

    pub fn get(&self, service: &str) -> Option<&VersionRange> {
        self.0.get(service).or_else(|| self.0.get("*"))
    }

    /// Whether `version` of `service` satisfies the constraints. A request
    /// without a constraint for the service accepts anything.
    pub fn allows(&self, service: &str, version: &Version) -> bool {
        match self.get(service) {
            Some(range) => range.contains(version),
            None => true,
        }
    }
}

impl fmt::Display for AcceptedVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (service, range) in &self.0 {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            if service == "*" {
                write!(f, "{range}")?;
            } else {
                write!(f, "{service}={range}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for AcceptedVersions {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut accepted = AcceptedVersions::default();
        if s.is_empty() {
            return Ok(accepted);
        }
        if !s.contains('=') {
            accepted.insert("*", s.parse()?);
            return Ok(accepted);
        }
        for entry in s.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (service, range) = entry
                .split_once('=')
                .ok_or_else(|| CodeError::bad_request(format!("invalid version entry '{entry}'")))?;
            accepted.insert(service.trim(), range.parse()?);
        }
        Ok(accepted)
    }
}
