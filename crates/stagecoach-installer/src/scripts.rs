//! Scripts shipped inside the binary and copied to hosts on demand.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker left on a host once prerequisites are installed.
pub const PREREQS_MARKER: &str = "/opt/dcos-prereqs.installed";
pub const PREREQS_SCRIPT_NAME: &str = "install_prereqs.sh";

const PREREQS_SCRIPT: &str = r#"#!/usr/bin/env bash
# Installs host prerequisites on RHEL/CentOS 7. Safe to re-run.
PATH=$PATH:/sbin

marker=/opt/dcos-prereqs.installed
if [ -f "$marker" ]; then
  echo "prerequisites already installed on this host, exiting..."
  exit 0
fi

dist=$(sed -n 's@^ID="\{0,1\}\([a-z]*\)"\{0,1\}$@\1@p' /etc/os-release)
case "$dist" in
  coreos)
    echo "Detected CoreOS. All prerequisites already installed" >&2
    exit 0
    ;;
  rhel|centos)
    ;;
  *)
    echo "$dist is not supported. Only RHEL and CentOS are supported" >&2
    exit 0
    ;;
esac

major=$(sed -n 's@^VERSION_ID="\{0,1\}\([0-9]*\).*@\1@p' /etc/os-release)
if [ "${major:-0}" -lt 7 ]; then
  echo "$major is not supported. Only >= 7 version is supported" >&2
  exit 0
fi

set -e

sudo setenforce 0 || true
sudo sed -i 's/^SELINUX=.*/SELINUX=disabled/g' /etc/sysconfig/selinux

sudo tee /etc/yum.repos.d/docker.repo <<-'EOF'
[dockerrepo]
name=Docker Repository
baseurl=https://yum.dockerproject.org/repo/main/centos/7
enabled=1
gpgcheck=1
gpgkey=https://yum.dockerproject.org/gpg
EOF

sudo yum -y update --exclude="docker-engine*"

sudo mkdir -p /etc/systemd/system/docker.service.d
sudo tee /etc/systemd/system/docker.service.d/override.conf <<-'EOF'
[Service]
Restart=always
StartLimitInterval=0
RestartSec=15
ExecStartPre=-/sbin/ip link del docker0
ExecStart=
ExecStart=/usr/bin/docker daemon --storage-driver=overlay -H fd://
EOF

sudo yum install -y docker-engine-1.11.2
sudo systemctl start docker
sudo systemctl enable docker

sudo yum install -y wget git unzip curl xz ipset

sudo getent group nogroup || sudo groupadd nogroup
sudo touch "$marker"
"#;

/// Write the prerequisites script into `dir` and return its path.
pub fn materialize_prereqs(dir: &Path) -> io::Result<PathBuf> {
    materialize(dir, PREREQS_SCRIPT_NAME, PREREQS_SCRIPT)
}

fn materialize(dir: &Path, name: &str, contents: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    if fs::read_to_string(&path).ok().as_deref() != Some(contents) {
        fs::write(&path, contents)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prereqs_script_checks_and_sets_marker() {
        assert!(PREREQS_SCRIPT.contains(&format!("marker={PREREQS_MARKER}")));
        assert!(PREREQS_SCRIPT.contains("if [ -f \"$marker\" ]"));
        assert!(PREREQS_SCRIPT.trim_end().ends_with("sudo touch \"$marker\""));
    }

    #[test]
    fn materialize_writes_script_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = materialize_prereqs(dir.path()).expect("write");
        assert_eq!(path, dir.path().join(PREREQS_SCRIPT_NAME));
        assert_eq!(fs::read_to_string(&path).expect("read"), PREREQS_SCRIPT);
        assert_eq!(materialize_prereqs(dir.path()).expect("rewrite"), path);
    }
}
