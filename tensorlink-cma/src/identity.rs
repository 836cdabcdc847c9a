//! Process identity facade.
//!
//! The kernel gates `process_vm_readv` behind a ptrace access-mode check:
//! the real, effective and saved user/group ids of the target must match
//! the caller's. Channels are bidirectional, so in practice both
//! processes need the same effective ids, on the same kernel. The domain
//! descriptor folds exactly that into a comparable string; reading the
//! identity through this facade keeps it injectable for tests.

use std::fs;

use tensorlink::error::{Error, Result};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// The identity facets that decide whether two processes may attach to
/// each other's memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub boot_id: String,
    pub euid: u32,
    pub egid: u32,
}

impl Identity {
    /// Reads the identity of the running process. Done once per context.
    pub fn system() -> Result<Self> {
        let boot_id = fs::read_to_string(BOOT_ID_PATH)
            .map_err(|err| Error::system_io("boot_id", &err))?;
        Ok(Self {
            boot_id: boot_id.trim().to_string(),
            euid: nix::unistd::geteuid().as_raw(),
            egid: nix::unistd::getegid().as_raw(),
        })
    }

    /// Renders the domain descriptor. Byte equality of two descriptors is
    /// the sole criterion for letting two contexts pair CMA channels.
    pub fn domain_descriptor(&self) -> String {
        format!("cma:{}/{}/{}", self.boot_id, self.euid, self.egid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_format() {
        let identity = Identity {
            boot_id: "f1a2".to_string(),
            euid: 1000,
            egid: 100,
        };
        assert_eq!(identity.domain_descriptor(), "cma:f1a2/1000/100");
    }

    #[test]
    fn test_system_identity() {
        let identity = Identity::system().unwrap();
        assert!(!identity.boot_id.is_empty());
        assert!(identity.domain_descriptor().starts_with("cma:"));
    }

    #[test]
    fn test_same_identity_same_domain() {
        let a = Identity {
            boot_id: "b".to_string(),
            euid: 1,
            egid: 2,
        };
        let b = a.clone();
        assert_eq!(a.domain_descriptor(), b.domain_descriptor());
        let other = Identity { euid: 3, ..a };
        assert_ne!(other.domain_descriptor(), b.domain_descriptor());
    }
}
