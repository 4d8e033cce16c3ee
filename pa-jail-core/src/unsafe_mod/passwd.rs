//! Password-database enumeration.
//!
//! `nix` wraps `getpwnam` but not the `setpwent`/`getpwent` iteration the
//! ownership pass needs to map `/home/<name>` entries to their owners.

use std::ffi::CStr;

/// One row of the password database.
pub struct PasswdEntry {
    /// The login name.
    pub name: String,
    /// The user id.
    pub uid: libc::uid_t,
    /// The primary group id.
    pub gid: libc::gid_t,
    /// The home directory, empty if unset.
    pub dir: String,
}

/// Enumerate every password-database entry.
pub fn all_entries() -> Vec<PasswdEntry> {
    let mut entries = Vec::new();
    unsafe {
        libc::setpwent();
        loop {
            let pw = libc::getpwent();
            if pw.is_null() {
                break;
            }
            let pw = &*pw;
            let name = if pw.pw_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(pw.pw_name).to_string_lossy().into_owned()
            };
            let dir = if pw.pw_dir.is_null() {
                String::new()
            } else {
                CStr::from_ptr(pw.pw_dir).to_string_lossy().into_owned()
            };
            entries.push(PasswdEntry {
                name,
                uid: pw.pw_uid,
                gid: pw.pw_gid,
                dir,
            });
        }
        libc::endpwent();
    }
    entries
}
