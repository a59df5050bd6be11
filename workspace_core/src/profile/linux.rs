//! Linux namespace jail expressed as bubblewrap (`bwrap`) directives.
//!
//! The jail starts from an empty tmpfs root. Only `/usr` (plus the merged-usr
//! compatibility entries), `/proc`, `/dev`, a private `/tmp` and a handful of
//! DNS/TLS configuration files are made visible, all read-only. The workspace is
//! bound read-write at a neutral mount point so the host path never leaks into the
//! jail. Every namespace is unshared and all capabilities are dropped; the network
//! namespace is shared back only when the policy allows it.

use std::path::{Component, Path, PathBuf};

use crate::policy::ExecutionPolicy;

/// Where the workspace appears inside the jail unless configured otherwise.
pub const DEFAULT_MOUNT_POINT: &str = "/app";

/// Top-level entries that merged-usr systems symlink into `/usr`.
const USR_COMPAT_ENTRIES: &[&str] = &["bin", "sbin", "lib", "lib64", "lib32", "libx32"];

/// Optional configuration needed for name resolution and TLS.
const TRUST_CONFIG_PATHS: &[&str] = &[
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/ssl/certs",
    "/etc/pki/tls/certs",
    "/etc/ca-certificates",
    "/etc/alternatives",
    "/etc/ld.so.cache",
];

/// Parent environment variables that survive into the jail.
pub const ENV_PASSTHROUGH: &[&str] = &[
    "PATH", "LANG", "LANGUAGE", "LC_ALL", "LC_CTYPE", "TERM", "TZ", "JAVA_HOME", "GOPATH",
    "FLUTTER_ROOT",
];

/// Where the jail's `HOME` points.
pub const JAIL_HOME: &str = "/tmp";

/// Per-user toolchains and package caches exposed read-only under the jail's
/// `HOME` when they exist in the host home directory.
pub const HOME_TOOL_DIRS: &[&str] = &[
    ".cargo",
    ".rustup",
    ".npm",
    ".gradle",
    ".m2",
    ".pub-cache",
    "go/pkg",
    ".flutter",
];

/// Binary directories of the mounted toolchains, appended to the jail `PATH`.
pub const HOME_TOOL_BIN_DIRS: &[&str] = &["/tmp/.cargo/bin", "/tmp/.pub-cache/bin"];

/// What a top-level host path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEntry {
    Missing,
    Directory,
    Symlink(PathBuf),
}

/// Inspect `path` on the real host without following symlinks.
pub fn probe_host(path: &Path) -> HostEntry {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::read_link(path)
            .map(HostEntry::Symlink)
            .unwrap_or(HostEntry::Missing),
        Ok(_) => HostEntry::Directory,
        Err(_) => HostEntry::Missing,
    }
}

/// Ordered bubblewrap arguments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceProfile {
    pub bwrap: PathBuf,
    pub directives: Vec<String>,
    pub mount_point: PathBuf,
}

impl NamespaceProfile {
    /// Build the jail for `policy` using the real host layout and home directory.
    pub fn build(policy: &ExecutionPolicy, bwrap: PathBuf, mount_point: &Path) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self::build_with(policy, bwrap, mount_point, home.as_deref(), probe_host)
    }

    /// Same as [`NamespaceProfile::build`] with an injectable home and host probe.
    pub fn build_with<F>(
        policy: &ExecutionPolicy,
        bwrap: PathBuf,
        mount_point: &Path,
        home: Option<&Path>,
        probe: F,
    ) -> Self
    where
        F: Fn(&Path) -> HostEntry,
    {
        let mut d = Directives::default();

        d.push(&["--unshare-all", "--new-session", "--die-with-parent"]);

        d.push(&["--tmpfs", "/"]);
        d.push(&["--ro-bind", "/usr", "/usr"]);
        for entry in USR_COMPAT_ENTRIES {
            let host_path = PathBuf::from("/").join(entry);
            let jail_path = host_path.to_string_lossy().into_owned();
            match probe(&host_path) {
                HostEntry::Symlink(target) => {
                    d.push(&["--symlink", &target.to_string_lossy(), &jail_path]);
                }
                HostEntry::Directory => d.push(&["--ro-bind-try", &jail_path, &jail_path]),
                HostEntry::Missing => {}
            }
        }

        d.push(&["--proc", "/proc"]);
        d.push(&["--dev", "/dev"]);
        d.push(&["--tmpfs", "/tmp"]);

        if let Some(home) = home.filter(|h| h.is_absolute()) {
            for dir in HOME_TOOL_DIRS {
                let host_path = home.join(dir);
                if probe(&host_path) == HostEntry::Missing {
                    continue;
                }
                let jail_path = format!("{JAIL_HOME}/{dir}");
                d.push(&["--ro-bind-try", &host_path.to_string_lossy(), &jail_path]);
            }
        }

        for path in TRUST_CONFIG_PATHS {
            d.push(&["--ro-bind-try", path, path]);
        }

        let root = policy.canonical_root();
        let mount = mount_point.to_string_lossy().into_owned();
        d.push(&["--bind", &root.to_string_lossy(), &mount]);
        let jail_cwd = jail_working_directory(policy, &root, mount_point);
        d.push(&["--chdir", &jail_cwd.to_string_lossy()]);

        if policy.allow_network {
            d.push(&["--share-net"]);
        } else {
            d.push(&["--unshare-net"]);
        }
        d.push(&["--cap-drop", "ALL"]);

        Self {
            bwrap,
            directives: d.0,
            mount_point: mount_point.to_path_buf(),
        }
    }

    /// `bwrap <directives> -- <argv>`.
    pub fn wrap(&self, argv: Vec<String>) -> (String, Vec<String>) {
        let mut args = Vec::with_capacity(self.directives.len() + argv.len() + 1);
        args.extend(self.directives.iter().cloned());
        args.push("--".to_string());
        args.extend(argv);
        (self.bwrap.to_string_lossy().into_owned(), args)
    }
}

#[derive(Default)]
struct Directives(Vec<String>);

impl Directives {
    fn push(&mut self, parts: &[&str]) {
        self.0.extend(parts.iter().map(|p| p.to_string()));
    }
}

/// Map the policy's working directory to its location inside the jail.
///
/// Directories outside the workspace are not visible in the jail, so they fall
/// back to the mount point itself.
fn jail_working_directory(policy: &ExecutionPolicy, root: &Path, mount_point: &Path) -> PathBuf {
    let Some(dir) = &policy.working_directory else {
        return mount_point.to_path_buf();
    };

    let relative = if dir.is_absolute() {
        let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        match canonical.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                tracing::warn!(
                    cwd = %dir.display(),
                    root = %root.display(),
                    "working directory is outside the workspace; using the workspace root"
                );
                return mount_point.to_path_buf();
            }
        }
    } else {
        dir.clone()
    };

    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        tracing::warn!(cwd = %dir.display(), "working directory escapes the workspace; using the workspace root");
        return mount_point.to_path_buf();
    }

    mount_point.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged_usr(path: &Path) -> HostEntry {
        match path.to_str() {
            Some("/bin") => HostEntry::Symlink(PathBuf::from("usr/bin")),
            Some("/lib") => HostEntry::Symlink(PathBuf::from("usr/lib")),
            Some("/sbin") => HostEntry::Directory,
            _ => HostEntry::Missing,
        }
    }

    fn profile(policy: &ExecutionPolicy) -> NamespaceProfile {
        NamespaceProfile::build_with(
            policy,
            PathBuf::from("/usr/bin/bwrap"),
            Path::new(DEFAULT_MOUNT_POINT),
            None,
            merged_usr,
        )
    }

    fn contains_seq(haystack: &[String], needle: &[&str]) -> bool {
        haystack
            .windows(needle.len())
            .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
    }

    #[test]
    fn starts_from_empty_root_with_readonly_usr() {
        let p = profile(&ExecutionPolicy::new("ws", "/nonexistent/ws").allow_network(false));
        let root_pos = p.directives.iter().position(|a| a == "/").unwrap();
        let usr_pos = p.directives.iter().position(|a| a == "/usr").unwrap();
        assert!(root_pos < usr_pos);
        assert!(contains_seq(&p.directives, &["--tmpfs", "/"]));
        assert!(contains_seq(&p.directives, &["--ro-bind", "/usr", "/usr"]));
        assert!(contains_seq(&p.directives, &["--tmpfs", "/tmp"]));
        assert!(contains_seq(&p.directives, &["--cap-drop", "ALL"]));
    }

    #[test]
    fn merged_usr_entries_follow_host_layout() {
        let p = profile(&ExecutionPolicy::new("ws", "/nonexistent/ws"));
        assert!(contains_seq(&p.directives, &["--symlink", "usr/bin", "/bin"]));
        assert!(contains_seq(&p.directives, &["--symlink", "usr/lib", "/lib"]));
        assert!(contains_seq(&p.directives, &["--ro-bind-try", "/sbin", "/sbin"]));
        assert!(!p.directives.iter().any(|a| a == "/lib64"));
    }

    #[test]
    fn home_toolchains_are_mounted_readonly_under_jail_home() {
        let with_tools = |path: &Path| match path.to_str() {
            Some("/home/dev/.cargo" | "/home/dev/.rustup" | "/home/dev/go/pkg") => {
                HostEntry::Directory
            }
            Some("/home/dev/.m2") => HostEntry::Symlink(PathBuf::from("/data/m2")),
            _ => HostEntry::Missing,
        };
        let p = NamespaceProfile::build_with(
            &ExecutionPolicy::new("ws", "/nonexistent/ws"),
            PathBuf::from("/usr/bin/bwrap"),
            Path::new(DEFAULT_MOUNT_POINT),
            Some(Path::new("/home/dev")),
            with_tools,
        );

        let d = &p.directives;
        assert!(contains_seq(d, &["--ro-bind-try", "/home/dev/.cargo", "/tmp/.cargo"]));
        assert!(contains_seq(d, &["--ro-bind-try", "/home/dev/.rustup", "/tmp/.rustup"]));
        assert!(contains_seq(d, &["--ro-bind-try", "/home/dev/go/pkg", "/tmp/go/pkg"]));
        assert!(contains_seq(d, &["--ro-bind-try", "/home/dev/.m2", "/tmp/.m2"]));
        assert!(!d.iter().any(|a| a == "/tmp/.npm" || a == "/tmp/.flutter"));
        // Mounted after the private /tmp, otherwise the tmpfs would hide them.
        let tmp_pos = d.iter().position(|a| a == "/tmp").unwrap();
        let cargo_pos = d.iter().position(|a| a == "/tmp/.cargo").unwrap();
        assert!(tmp_pos < cargo_pos);
        assert!(!d.iter().any(|a| a == "/home/dev"));
    }

    #[test]
    fn missing_or_relative_home_mounts_no_toolchains() {
        let everything = |_: &Path| HostEntry::Directory;
        for home in [None, Some(Path::new("relative/home"))] {
            let p = NamespaceProfile::build_with(
                &ExecutionPolicy::new("ws", "/nonexistent/ws"),
                PathBuf::from("/usr/bin/bwrap"),
                Path::new(DEFAULT_MOUNT_POINT),
                home,
                everything,
            );
            assert!(!p.directives.iter().any(|a| a.starts_with("/tmp/.")));
        }
    }

    #[test]
    fn workspace_is_bound_at_neutral_mount_point() {
        let p = profile(&ExecutionPolicy::new("ws", "/nonexistent/ws"));
        assert!(contains_seq(
            &p.directives,
            &["--bind", "/nonexistent/ws", "/app"]
        ));
        assert!(contains_seq(&p.directives, &["--chdir", "/app"]));
    }

    #[test]
    fn relative_working_directory_maps_inside_mount() {
        let policy = ExecutionPolicy::new("ws", "/nonexistent/ws").working_directory("src/bin");
        let p = profile(&policy);
        assert!(contains_seq(&p.directives, &["--chdir", "/app/src/bin"]));

        let escaping = ExecutionPolicy::new("ws", "/nonexistent/ws").working_directory("../etc");
        assert!(contains_seq(&profile(&escaping).directives, &["--chdir", "/app"]));

        let outside = ExecutionPolicy::new("ws", "/nonexistent/ws").working_directory("/etc");
        assert!(contains_seq(&profile(&outside).directives, &["--chdir", "/app"]));
    }

    #[test]
    fn network_policy_toggles_namespace() {
        let offline = profile(&ExecutionPolicy::new("ws", "/w").allow_network(false));
        assert!(offline.directives.contains(&"--unshare-net".to_string()));
        assert!(!offline.directives.contains(&"--share-net".to_string()));

        let online = profile(&ExecutionPolicy::new("ws", "/w").allow_network(true));
        assert!(online.directives.contains(&"--share-net".to_string()));
    }

    #[test]
    fn trust_configuration_is_best_effort() {
        let p = profile(&ExecutionPolicy::new("ws", "/w"));
        assert!(contains_seq(
            &p.directives,
            &["--ro-bind-try", "/etc/resolv.conf", "/etc/resolv.conf"]
        ));
        assert!(!contains_seq(&p.directives, &["--ro-bind", "/etc/resolv.conf"]));
    }

    #[test]
    fn wrap_places_command_after_delimiter() {
        let p = profile(&ExecutionPolicy::new("ws", "/w"));
        let (program, args) = p.wrap(vec!["echo".into(), "hi".into()]);
        assert_eq!(program, "/usr/bin/bwrap");
        let n = args.len();
        assert_eq!(&args[n - 3..], &["--", "echo", "hi"]);
    }
}
