//! Validation of the caller identity handed to the helper at startup.
//!
//! On Windows the helper receives the launching user's SID on the command
//! line and grants that identity (plus SYSTEM) access to the pipe. Accepting
//! a group SID here would silently widen the pipe ACL to every member of the
//! group, so only concrete user-account SIDs pass.

use anyhow::{bail, Result};

/// Broad principals that must never appear on the pipe ACL as the
/// "launching user".
const BROAD_SIDS: &[(&str, &str)] = &[
    ("S-1-1-0", "Everyone"),
    ("S-1-2-0", "Local"),
    ("S-1-2-1", "Console Logon"),
    ("S-1-5-2", "Network"),
    ("S-1-5-4", "Interactive"),
    ("S-1-5-7", "Anonymous"),
    ("S-1-5-11", "Authenticated Users"),
    ("S-1-5-32", "Built-in aliases"),
];

/// Checks that `sid` is a well-formed, non-broad, user-class security
/// identifier of the `S-1-5-21-<domain>-<rid>` form.
pub fn validate_user_sid(sid: &str) -> Result<()> {
    for (broad, name) in BROAD_SIDS {
        if sid == *broad || sid.starts_with(&format!("{broad}-")) {
            bail!("SID {sid} names the broad principal '{name}', not a user account");
        }
    }

    let mut parts = sid.split('-');
    if parts.next() != Some("S") {
        bail!("SID {sid} does not start with 'S-'");
    }
    if parts.next() != Some("1") {
        bail!("SID {sid} has an unsupported revision");
    }

    let rest: Vec<&str> = parts.collect();
    // Identifier authority plus at least one subauthority.
    if rest.len() < 2 {
        bail!("SID {sid} is too short to name an account");
    }
    for part in &rest {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            bail!("SID {sid} contains the non-numeric component '{part}'");
        }
    }

    // User accounts (local or domain) live under the NT authority with the
    // 21 subauthority prefix and carry a domain triplet plus an RID.
    let authority: u64 = rest[0].parse()?;
    if authority != 5 {
        bail!("SID {sid} is not under the NT authority");
    }
    let subauthorities = &rest[1..];
    if subauthorities[0] != "21" {
        bail!("SID {sid} does not name a user account (expected the S-1-5-21 prefix)");
    }
    if subauthorities.len() != 5 {
        bail!(
            "SID {sid} has {} subauthorities, expected 5 (domain triplet plus RID)",
            subauthorities.len()
        );
    }
    for sub in subauthorities {
        let _: u32 = sub
            .parse()
            .map_err(|_| anyhow::anyhow!("SID {sid} subauthority '{sub}' overflows 32 bits"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_local_and_domain_user_sids() {
        validate_user_sid("S-1-5-21-3623811015-3361044348-30300820-1013").unwrap();
        validate_user_sid("S-1-5-21-1-2-3-500").unwrap();
    }

    #[test]
    fn rejects_broad_principals() {
        for sid in [
            "S-1-1-0",   // Everyone
            "S-1-5-7",   // Anonymous
            "S-1-5-11",  // Authenticated Users
            "S-1-5-4",   // Interactive
            "S-1-5-32-544", // BUILTIN\Administrators
        ] {
            assert!(validate_user_sid(sid).is_err(), "{sid} should be rejected");
        }
    }

    #[test]
    fn rejects_malformed_sids() {
        for sid in [
            "",
            "bogus",
            "S-2-5-21-1-2-3-1000",
            "S-1-5",
            "S-1-5-21-1-2-3",          // missing RID
            "S-1-5-21-1-2-3-4-5",      // too many subauthorities
            "S-1-5-21-1-2-x-1000",     // non-numeric
            "S-1-5-21-1-2-3-99999999999", // RID overflows u32
        ] {
            assert!(validate_user_sid(sid).is_err(), "{sid} should be rejected");
        }
    }

    #[test]
    fn rejects_well_known_service_accounts() {
        // SYSTEM gets pipe access implicitly; it is not a valid launching user.
        assert!(validate_user_sid("S-1-5-18").is_err());
        assert!(validate_user_sid("S-1-5-19").is_err());
        assert!(validate_user_sid("S-1-5-20").is_err());
    }
}
