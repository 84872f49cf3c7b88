//! Derived container names
//!
//! Containers are named `<sep><owner-hash><sep><discriminator><role-suffix>`
//! so the role is recoverable from the name alone, without a side lookup.
//! Service/API containers carry a suffix; anything unsuffixed is a session.

use crate::models::ContainerRole;
use sha2::{Digest, Sha256};

pub const NAME_SEP: char = '_';

/// Suffix for API-worker containers.
pub const SFX_API: &str = "_fltapi";
/// Suffix for internal-service containers.
pub const SFX_INTERNAL: &str = "_fltsvc";

/// Strip the leading slash some runtimes prepend to container names.
pub fn normalize(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Short stable hash of the owner identity, used as the session name stem.
pub fn owner_hash(owner: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hex::encode(&hasher.finalize()[..6])
}

/// Derived container name for an owner. At most one running container may
/// exist per derived name; the discriminator separates multiple workloads
/// of the same owner and role.
pub fn derived_name(role: ContainerRole, owner: &str, discriminator: u32) -> String {
    let stem = format!(
        "{sep}{hash}{sep}{discriminator}",
        sep = NAME_SEP,
        hash = owner_hash(owner),
        discriminator = discriminator
    );
    match role {
        ContainerRole::Session => stem,
        ContainerRole::ApiWorker => format!("{stem}{SFX_API}"),
        ContainerRole::Internal => format!("{stem}{SFX_INTERNAL}"),
    }
}

/// Recover the role from a (possibly slash-prefixed) container name.
pub fn role_of(name: &str) -> ContainerRole {
    let name = normalize(name);
    if name.ends_with(SFX_API) {
        ContainerRole::ApiWorker
    } else if name.ends_with(SFX_INTERNAL) {
        ContainerRole::Internal
    } else {
        ContainerRole::Session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_recoverable_from_name() {
        let sess = derived_name(ContainerRole::Session, "user@example.org", 0);
        let api = derived_name(ContainerRole::ApiWorker, "user@example.org", 0);
        let svc = derived_name(ContainerRole::Internal, "user@example.org", 0);

        assert_eq!(role_of(&sess), ContainerRole::Session);
        assert_eq!(role_of(&api), ContainerRole::ApiWorker);
        assert_eq!(role_of(&svc), ContainerRole::Internal);
    }

    #[test]
    fn test_normalize_strips_runtime_slash() {
        let sess = derived_name(ContainerRole::Session, "user@example.org", 0);
        let slashed = format!("/{sess}");
        assert_eq!(normalize(&slashed), sess);
        assert_eq!(role_of(&slashed), ContainerRole::Session);
    }

    #[test]
    fn test_names_stable_and_distinct_per_owner() {
        let a1 = derived_name(ContainerRole::Session, "a@example.org", 0);
        let a2 = derived_name(ContainerRole::Session, "a@example.org", 0);
        let b = derived_name(ContainerRole::Session, "b@example.org", 0);

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_discriminator_separates_workloads() {
        let d0 = derived_name(ContainerRole::Session, "a@example.org", 0);
        let d1 = derived_name(ContainerRole::Session, "a@example.org", 1);
        assert_ne!(d0, d1);
    }
}
