//! Drop root privileges to an unprivileged user after interface, routing and
//! NAT setup are done, and regain them once the event loop exits so NAT
//! teardown has the permissions it needs, mirroring the original `runas()`
//! call's two placements.

use nix::unistd::{self, Group, User};

use crate::CliResult;

/// Resolve `username` and switch the process's uid/gid to it. Group is set
/// before user, since changing the uid first would forfeit the permission
/// needed to change the gid.
pub fn drop_to(username: &str) -> CliResult<()> {
    let user = User::from_name(username)
        .map_err(|e| format!("failed to look up user {username:?}: {e}"))?
        .ok_or_else(|| format!("no such user: {username:?}"))?;

    if let Some(group) = Group::from_gid(user.gid).map_err(|e| format!("failed to look up group {}: {e}", user.gid))? {
        unistd::setgid(group.gid).map_err(|e| format!("setgid failed: {e}"))?;
    }

    unistd::setuid(user.uid).map_err(|e| format!("setuid failed: {e}"))?;

    Ok(())
}

/// Switch back to root. Called after the event loop exits so that NAT
/// teardown and any other post-loop cleanup run with the same privilege the
/// process started with, matching `runas("root")`'s placement right after
/// the loop returns.
pub fn regain_root() -> CliResult<()> {
    let user = User::from_name("root")
        .map_err(|e| format!("failed to look up user \"root\": {e}"))?
        .ok_or_else(|| "no such user: \"root\"".to_string())?;

    unistd::setuid(user.uid).map_err(|e| format!("setuid failed: {e}"))?;

    if let Some(group) = Group::from_gid(user.gid).map_err(|e| format!("failed to look up group {}: {e}", user.gid))? {
        unistd::setgid(group.gid).map_err(|e| format!("setgid failed: {e}"))?;
    }

    Ok(())
}
