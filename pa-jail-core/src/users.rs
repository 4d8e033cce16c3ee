//! Resolution and vetting of the jail owner.

use crate::errors::JailError;
use nix::unistd::{Gid, Uid, User};
use std::io::BufRead;

/// The unprivileged user a jail is built for and run as.
#[derive(Debug, Clone)]
pub struct JailOwner {
    /// The owner's uid; never 0.
    pub uid: Uid,
    /// The owner's primary gid.
    pub gid: Gid,
    /// The owner's home inside the jail: `/home/<name>` or `/home/nobody`.
    pub home: String,
    /// The owner's login shell.
    pub shell: String,
}

fn listed_in_shells(shell: &str) -> bool {
    let Ok(file) = std::fs::File::open("/etc/shells") else {
        return false;
    };
    for line in std::io::BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') && line == shell {
            return true;
        }
    }
    false
}

impl JailOwner {
    /// Look `name` up in the host password database and vet the result.
    ///
    /// The uid must not be root; the home directory must be `/` (remapped
    /// to `/home/nobody`) or a single component under `/home/`; the shell
    /// must be `/bin/bash`, `/bin/sh`, or listed in `/etc/shells`.
    pub fn lookup(name: &str) -> Result<JailOwner, JailError> {
        if name.len() >= 1024 {
            return Err(JailError::UserNameTooLong {
                name: name.to_string(),
            });
        }
        let user = match User::from_name(name) {
            Ok(Some(user)) => user,
            _ => {
                return Err(JailError::UnknownUser {
                    name: name.to_string(),
                })
            }
        };

        let pw_dir = user.dir.to_string_lossy().into_owned();
        let home = if pw_dir == "/" {
            "/home/nobody".to_string()
        } else {
            let component = pw_dir.strip_prefix("/home/");
            match component {
                Some(c) if !c.is_empty() && !c.contains('/') => pw_dir.clone(),
                _ => {
                    return Err(JailError::HomeNotAllowed {
                        name: name.to_string(),
                        home: pw_dir,
                    })
                }
            }
        };

        let shell = user.shell.to_string_lossy().into_owned();
        if shell != "/bin/bash" && shell != "/bin/sh" && !listed_in_shells(&shell) {
            return Err(JailError::ShellNotAllowed {
                name: name.to_string(),
                shell,
            });
        }

        if user.uid.is_root() {
            return Err(JailError::RootUser {
                name: name.to_string(),
            });
        }

        Ok(JailOwner {
            uid: user.uid,
            gid: user.gid,
            home,
            shell,
        })
    }
}
