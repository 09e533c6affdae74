use std::fmt;
use std::process::Command;

/// A host tool the chroot pipeline needs but cannot find.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .is_ok_and(|o| o.status.success())
}

const CHROOT_TOOLS: &[MissingPrereq] = &[
    MissingPrereq {
        name: "mount",
        purpose: "mounting the build volume and chroot filesystems",
        install_hint: "part of util-linux (usually pre-installed)",
    },
    MissingPrereq {
        name: "umount",
        purpose: "unmounting after provisioning",
        install_hint: "part of util-linux (usually pre-installed)",
    },
    MissingPrereq {
        name: "chroot",
        purpose: "running provisioning commands inside the image",
        install_hint: "part of coreutils (usually pre-installed)",
    },
    MissingPrereq {
        name: "cp",
        purpose: "copying host files into the chroot",
        install_hint: "part of coreutils (usually pre-installed)",
    },
];

/// Host tools missing for a chroot build. Empty means ready.
pub fn check_chroot_prereqs() -> Vec<&'static MissingPrereq> {
    CHROOT_TOOLS
        .iter()
        .filter(|tool| !command_exists(tool.name))
        .collect()
}

pub fn format_missing(missing: &[&MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nkiln runs these tools on the build host to assemble the image.");
    msg
}
