//! Hostname, `/etc/hosts`, and `/etc/resolv.conf` emission.
//!
//! All three are advisory: failures are logged by the caller and boot
//! continues. Functions take the etc directory so tests run against a
//! tempdir.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use crate::config::{EtcHost, EtcResolv};

/// Set the kernel hostname and persist it to `<etc>/hostname`.
///
/// An empty hostname is a no-op.
pub fn set_hostname(etc: &Path, hostname: &str) -> std::io::Result<()> {
    if hostname.is_empty() {
        return Ok(());
    }
    nix::unistd::sethostname(hostname).map_err(std::io::Error::from)?;
    ensure_etc(etc);
    std::fs::write(etc.join("hostname"), format!("{hostname}\n"))
}

/// Append the configured host entries to `<etc>/hosts`.
pub fn write_hosts(etc: &Path, entries: &[EtcHost]) -> std::io::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    ensure_etc(etc);
    let mut f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(etc.join("hosts"))?;

    let mut block = String::new();
    for e in entries {
        if e.desc.is_empty() {
            let _ = write!(block, "\n{}\t{}\n", e.ip, e.host);
        } else {
            let _ = write!(block, "\n# {}\n{}\t{}\n", e.desc, e.ip, e.host);
        }
    }
    f.write_all(block.as_bytes())
}

/// Overwrite `<etc>/resolv.conf` with the configured nameservers.
pub fn write_resolv(etc: &Path, resolv: Option<&EtcResolv>) -> std::io::Result<()> {
    let Some(resolv) = resolv else { return Ok(()) };
    if resolv.nameservers.is_empty() {
        return Ok(());
    }
    ensure_etc(etc);
    let mut content = String::new();
    for ns in &resolv.nameservers {
        let _ = writeln!(content, "nameserver {ns}");
    }
    std::fs::write(etc.join("resolv.conf"), content)
}

fn ensure_etc(etc: &Path) {
    let _ = std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(etc);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_appends_entries_with_desc() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1\tlocalhost\n").unwrap();

        let entries = vec![
            EtcHost {
                host: "db.internal".into(),
                ip: "10.0.0.3".into(),
                desc: "database".into(),
            },
            EtcHost {
                host: "cache.internal".into(),
                ip: "10.0.0.4".into(),
                desc: String::new(),
            },
        ];
        write_hosts(dir.path(), &entries).unwrap();

        let content = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(content.contains("\n# database\n10.0.0.3\tdb.internal\n"));
        assert!(content.contains("\n10.0.0.4\tcache.internal\n"));
    }

    #[test]
    fn hosts_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_hosts(dir.path(), &[]).unwrap();
        assert!(!dir.path().join("hosts").exists());
    }

    #[test]
    fn resolv_overwrites_with_nameserver_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("resolv.conf"), "nameserver 127.0.0.53\n").unwrap();

        let resolv = EtcResolv {
            nameservers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
        };
        write_resolv(dir.path(), Some(&resolv)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(content, "nameserver 1.1.1.1\nnameserver 8.8.8.8\n");
    }

    #[test]
    fn resolv_none_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_resolv(dir.path(), None).unwrap();
        assert!(!dir.path().join("resolv.conf").exists());
    }

    #[test]
    fn hostname_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        set_hostname(dir.path(), "").unwrap();
        assert!(!dir.path().join("hostname").exists());
    }
}
