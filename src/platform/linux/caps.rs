use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};

use crate::error::{Error, ErrorKind, Result};

/// Parse a capability list property: `CHOWN; NET_ADMIN; ...` (the CAP_
/// prefix is accepted but not required).
pub fn parse_caps(spec: &str) -> Result<CapsHashSet> {
    let mut set = CapsHashSet::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let name = if part.starts_with("CAP_") {
            part.to_string()
        } else {
            format!("CAP_{part}")
        };
        let cap = Capability::from_str(&name).map_err(|_| {
            Error::new(ErrorKind::InvalidValue, format!("unknown capability '{part}'"))
        })?;
        set.insert(cap);
    }
    Ok(set)
}

/// Capabilities the helper init keeps after the launcher hands control over.
pub fn helper_init_caps() -> CapsHashSet {
    let mut set = CapsHashSet::new();
    set.insert(Capability::CAP_KILL);
    set
}

/// The container's capability configuration, applied in the only valid
/// order: ambient first (needs the full inheritable set), then the bounding
/// reduction, then effective for non-root tasks. The steps are private so no
/// other order can be expressed.
#[derive(Debug, Clone)]
pub struct CapabilityPlan {
    pub bound: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl CapabilityPlan {
    pub fn new(bound: CapsHashSet, ambient: CapsHashSet) -> Self {
        Self { bound, ambient }
    }

    pub fn apply(&self, root_user: bool) -> Result<()> {
        self.apply_ambient()?;
        self.apply_bounding()?;
        if !root_user {
            self.apply_effective()?;
        }
        Ok(())
    }

    fn apply_ambient(&self) -> Result<()> {
        if self.ambient.is_empty() {
            return Ok(());
        }
        caps::set(None, CapSet::Inheritable, &self.ambient)?;
        for cap in &self.ambient {
            caps::raise(None, CapSet::Ambient, *cap)?;
        }
        Ok(())
    }

    fn apply_bounding(&self) -> Result<()> {
        let current = caps::read(None, CapSet::Bounding)?;
        for cap in current.difference(&self.bound) {
            caps::drop(None, CapSet::Bounding, *cap)?;
        }
        Ok(())
    }

    fn apply_effective(&self) -> Result<()> {
        caps::set(None, CapSet::Effective, &self.ambient)?;
        Ok(())
    }
}

/// Reduce the current process to `keep` before exec'ing the helper init.
pub fn limit_to(keep: &CapsHashSet) -> Result<()> {
    let current = caps::read(None, CapSet::Bounding)?;
    for cap in current.difference(keep) {
        caps::drop(None, CapSet::Bounding, *cap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_spellings() {
        let set = parse_caps("CHOWN; CAP_NET_ADMIN").unwrap();
        assert!(set.contains(&Capability::CAP_CHOWN));
        assert!(set.contains(&Capability::CAP_NET_ADMIN));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = parse_caps("FLY").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn empty_spec_is_empty_set() {
        assert!(parse_caps("").unwrap().is_empty());
        assert!(parse_caps(" ; ").unwrap().is_empty());
    }

    #[test]
    fn helper_init_keeps_kill_only() {
        let set = helper_init_caps();
        assert!(set.contains(&Capability::CAP_KILL));
        assert_eq!(set.len(), 1);
    }
}
