//! [`NicControl`] over the Linux control tools and sysfs.
//!
//! | Operation | Backing |
//! |-----------|---------|
//! | driver, channels, features, rules | `ethtool -i/-l/-k/-K/-n/-N` |
//! | tuning passthrough | `ethtool -L/-G/-C` |
//! | SR-IOV count, VF names | `/sys/class/net/<if>/device/...` |
//! | link up | `ip link set dev <if> up` |
//! | mirroring | `tc` clsact + matchall/mirred, hardware only |

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::device::NicControl;
use crate::error::{NicError, NicResult};
use crate::ethtool;
use crate::shell::{self, shellquote, ExecResult};
use crate::types::{AppliedRuleTable, Coalesce, DriverInfo, Feature, FeatureState, FlowRule};

/// Paths of the external tools and the sysfs mount.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ethtool: String,
    pub ip: String,
    pub tc: String,
    pub sysfs_root: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ethtool: shell::ETHTOOL_CMD.to_string(),
            ip: shell::IP_CMD.to_string(),
            tc: shell::TC_CMD.to_string(),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

/// Production NIC transport.
#[derive(Debug, Clone, Default)]
pub struct LinuxNic {
    paths: ToolPaths,
}

impl LinuxNic {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    fn net_dir(&self, iface: &str) -> PathBuf {
        self.paths.sysfs_root.join("class/net").join(iface)
    }

    fn device_attr(&self, iface: &str, attr: &str) -> PathBuf {
        self.net_dir(iface).join("device").join(attr)
    }

    fn ethtool(&self, args: &str, iface: &str) -> String {
        format!("{} {} {}", self.paths.ethtool, args, shellquote(iface))
    }

    /// Runs an ethtool command, mapping "no such device" and "not
    /// supported" replies to their typed errors.
    async fn ethtool_checked(&self, iface: &str, cmd: &str, operation: &str) -> NicResult<String> {
        let result = shell::exec(cmd).await?;
        if result.success() {
            return Ok(result.stdout);
        }
        if let Some(e) = Self::device_failure(iface, &result) {
            return Err(e);
        }
        if ethtool::is_unsupported(&result.combined_output()) {
            return Err(NicError::unsupported(iface, operation));
        }
        Err(result.failure())
    }

    /// Failures that mean the control surface or the interface is gone,
    /// as opposed to the device refusing one request.
    fn device_failure(iface: &str, result: &ExecResult) -> Option<NicError> {
        if let Some(e) = result.missing_tool() {
            return Some(e);
        }
        ethtool::is_no_such_device(&result.combined_output())
            .then(|| NicError::interface_not_found(iface))
    }

    async fn read_attr(path: &Path) -> NicResult<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NicError::io(path, e)),
        }
    }

    async fn read_u32_attr(path: &Path) -> NicResult<Option<u32>> {
        match Self::read_attr(path).await? {
            Some(s) => s.parse::<u32>().map(Some).map_err(|e| {
                NicError::parse(path.display().to_string(), format!("'{s}': {e}"))
            }),
            None => Ok(None),
        }
    }

    async fn queue_count_from_sysfs(&self, iface: &str) -> NicResult<Option<u32>> {
        let dir = self.net_dir(iface).join("queues");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NicError::io(dir, e)),
        };
        let mut count = 0u32;
        while let Some(entry) = entries.next_entry().await.map_err(|e| NicError::io(&dir, e))? {
            if entry.file_name().to_string_lossy().starts_with("rx-") {
                count += 1;
            }
        }
        Ok((count > 0).then_some(count))
    }
}

#[async_trait]
impl NicControl for LinuxNic {
    async fn interface_exists(&self, iface: &str) -> NicResult<bool> {
        let dir = self.net_dir(iface);
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| NicError::io(dir, e))
    }

    #[instrument(skip(self))]
    async fn driver_info(&self, iface: &str) -> NicResult<DriverInfo> {
        let cmd = self.ethtool("-i", iface);
        let out = self.ethtool_checked(iface, &cmd, "driver info").await?;
        ethtool::parse_driver_info(&out)
    }

    #[instrument(skip(self))]
    async fn queue_count(&self, iface: &str) -> NicResult<Option<u32>> {
        let cmd = self.ethtool("-l", iface);
        match self.ethtool_checked(iface, &cmd, "channel query").await {
            Ok(out) => {
                if let Some(n) = ethtool::parse_channels(&out)?.current.rx_queues() {
                    return Ok(Some(n));
                }
            }
            Err(NicError::Unsupported { .. }) => {
                debug!("ethtool -l unsupported on {}, falling back to sysfs", iface);
            }
            Err(e) => return Err(e),
        }
        self.queue_count_from_sysfs(iface).await
    }

    #[instrument(skip(self))]
    async fn feature(&self, iface: &str, feature: Feature) -> NicResult<Option<FeatureState>> {
        let cmd = self.ethtool("-k", iface);
        let out = self.ethtool_checked(iface, &cmd, "feature query").await?;
        Ok(ethtool::parse_feature(&out, feature.ethtool_name()))
    }

    #[instrument(skip(self))]
    async fn set_feature(&self, iface: &str, feature: Feature, enabled: bool) -> NicResult<()> {
        let cmd = format!(
            "{} {} {}",
            self.ethtool("-K", iface),
            feature.ethtool_short_name(),
            if enabled { "on" } else { "off" }
        );
        self.ethtool_checked(iface, &cmd, feature.ethtool_short_name())
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_rules(&self, iface: &str) -> NicResult<AppliedRuleTable> {
        let cmd = self.ethtool("-n", iface);
        let out = self.ethtool_checked(iface, &cmd, "rule listing").await?;
        Ok(ethtool::parse_rule_listing(&out)?.table)
    }

    #[instrument(skip(self), fields(port = rule.dest_port, queue = rule.queue()))]
    async fn add_rule(&self, iface: &str, rule: &FlowRule) -> NicResult<u32> {
        let cmd = format!(
            "{} flow-type {} dst-port {} action {}",
            self.ethtool("-N", iface),
            rule.protocol.flow_type(),
            rule.dest_port,
            rule.queue()
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            if let Some(e) = Self::device_failure(iface, &result) {
                return Err(e);
            }
            let output = result.combined_output();
            return Err(NicError::RuleRejected {
                interface: iface.to_string(),
                kind: ethtool::classify_rejection(&output),
                message: output,
            });
        }
        if let Some(id) = ethtool::parse_added_rule_id(&result.combined_output()) {
            return Ok(id);
        }

        // Older ethtool prints nothing on success; find the rule instead.
        let table = self.list_rules(iface).await?;
        let listed = table
            .iter()
            .find(|r| r.rule.as_ref() == Some(rule))
            .map(|r| r.id);
        listed.ok_or_else(|| {
            NicError::parse(
                "ethtool -N output",
                format!("rule {} accepted but not listed", rule),
            )
        })
    }

    #[instrument(skip(self))]
    async fn delete_rule(&self, iface: &str, rule_id: u32) -> NicResult<()> {
        let cmd = format!("{} delete {}", self.ethtool("-N", iface), rule_id);
        let result = shell::exec(&cmd).await?;
        if result.success() {
            return Ok(());
        }
        if let Some(e) = Self::device_failure(iface, &result) {
            return Err(e);
        }
        Err(NicError::DeleteFailed {
            interface: iface.to_string(),
            rule_id,
            message: result.combined_output(),
        })
    }

    async fn sriov_total_vfs(&self, iface: &str) -> NicResult<Option<u32>> {
        Self::read_u32_attr(&self.device_attr(iface, "sriov_totalvfs")).await
    }

    async fn sriov_num_vfs(&self, iface: &str) -> NicResult<u32> {
        Ok(Self::read_u32_attr(&self.device_attr(iface, "sriov_numvfs"))
            .await?
            .unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn set_sriov_num_vfs(&self, iface: &str, count: u32) -> NicResult<()> {
        let path = self.device_attr(iface, "sriov_numvfs");
        tokio::fs::write(&path, format!("{count}\n"))
            .await
            .map_err(|e| NicError::io(path, e))
    }

    async fn vf_interface_names(&self, iface: &str, vf_index: u32) -> NicResult<Vec<String>> {
        let dir = self.device_attr(iface, &format!("virtfn{vf_index}/net"));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NicError::io(dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| NicError::io(&dir, e))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn set_link_up(&self, name: &str) -> NicResult<()> {
        let cmd = format!("{} link set dev {} up", self.paths.ip, shellquote(name));
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn set_vf_mirror(&self, iface: &str, src: &str, dst: &str) -> NicResult<()> {
        let qdisc = format!("{} qdisc add dev {} clsact", self.paths.tc, shellquote(src));
        let result = shell::exec(&qdisc).await?;
        if !result.success() && !result.combined_output().contains("File exists") {
            return Err(result.failure());
        }

        let filter = format!(
            "{} filter add dev {} ingress matchall skip_sw action mirred egress mirror dev {}",
            self.paths.tc,
            shellquote(src),
            shellquote(dst)
        );
        let result = shell::exec(&filter).await?;
        if result.success() {
            return Ok(());
        }
        if result.missing_tool().is_none() && ethtool::is_unsupported(&result.combined_output()) {
            return Err(NicError::unsupported(
                iface,
                format!("hardware mirror {src} -> {dst}"),
            ));
        }
        Err(result.failure())
    }

    async fn combined_channels(&self, iface: &str) -> NicResult<Option<u32>> {
        let cmd = self.ethtool("-l", iface);
        let out = self.ethtool_checked(iface, &cmd, "channel query").await?;
        let combined = ethtool::parse_channels(&out)?.current.combined;
        Ok((combined > 0).then_some(combined))
    }

    async fn rx_ring(&self, iface: &str) -> NicResult<Option<u32>> {
        let cmd = self.ethtool("-g", iface);
        let out = self.ethtool_checked(iface, &cmd, "ring query").await?;
        ethtool::parse_rx_ring(&out)
    }

    async fn coalesce(&self, iface: &str) -> NicResult<Coalesce> {
        let cmd = self.ethtool("-c", iface);
        let out = self.ethtool_checked(iface, &cmd, "coalesce query").await?;
        ethtool::parse_coalesce(&out)
    }

    #[instrument(skip(self))]
    async fn set_combined_channels(&self, iface: &str, count: u32) -> NicResult<()> {
        let cmd = format!("{} combined {}", self.ethtool("-L", iface), count);
        self.ethtool_checked(iface, &cmd, "set channels")
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn set_rx_ring(&self, iface: &str, entries: u32) -> NicResult<()> {
        let cmd = format!("{} rx {}", self.ethtool("-G", iface), entries);
        self.ethtool_checked(iface, &cmd, "set ring").await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn set_coalesce(&self, iface: &str, coalesce: &Coalesce) -> NicResult<()> {
        if coalesce.is_empty() {
            return Ok(());
        }
        let mut cmd = self.ethtool("-C", iface);
        if let Some(adaptive) = coalesce.adaptive_rx {
            cmd.push_str(if adaptive {
                " adaptive-rx on"
            } else {
                " adaptive-rx off"
            });
        }
        if let Some(usecs) = coalesce.rx_usecs {
            cmd.push_str(&format!(" rx-usecs {usecs}"));
        }
        self.ethtool_checked(iface, &cmd, "set coalesce")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_sysfs() -> (tempfile::TempDir, LinuxNic) {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("class/net/enp3s0f0/device");
        fs::create_dir_all(dev.join("virtfn0/net/enp3s0f0v0")).unwrap();
        fs::create_dir_all(dev.join("virtfn1/net")).unwrap();
        fs::create_dir_all(dir.path().join("class/net/enp3s0f0/queues/rx-0")).unwrap();
        fs::create_dir_all(dir.path().join("class/net/enp3s0f0/queues/rx-1")).unwrap();
        fs::create_dir_all(dir.path().join("class/net/enp3s0f0/queues/tx-0")).unwrap();
        fs::write(dev.join("sriov_totalvfs"), "8\n").unwrap();
        fs::write(dev.join("sriov_numvfs"), "2\n").unwrap();

        let nic = LinuxNic::new(ToolPaths {
            sysfs_root: dir.path().to_path_buf(),
            ..Default::default()
        });
        (dir, nic)
    }

    #[tokio::test]
    async fn test_interface_exists() {
        let (_dir, nic) = fake_sysfs();
        assert!(nic.interface_exists("enp3s0f0").await.unwrap());
        assert!(!nic.interface_exists("eth9").await.unwrap());
    }

    #[tokio::test]
    async fn test_sriov_attrs() {
        let (_dir, nic) = fake_sysfs();
        assert_eq!(nic.sriov_total_vfs("enp3s0f0").await.unwrap(), Some(8));
        assert_eq!(nic.sriov_num_vfs("enp3s0f0").await.unwrap(), 2);

        nic.set_sriov_num_vfs("enp3s0f0", 0).await.unwrap();
        assert_eq!(nic.sriov_num_vfs("enp3s0f0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sriov_absent() {
        let (dir, nic) = fake_sysfs();
        fs::create_dir_all(dir.path().join("class/net/lo")).unwrap();
        assert_eq!(nic.sriov_total_vfs("lo").await.unwrap(), None);
        assert_eq!(nic.sriov_num_vfs("lo").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_vf_interface_names() {
        let (_dir, nic) = fake_sysfs();
        assert_eq!(
            nic.vf_interface_names("enp3s0f0", 0).await.unwrap(),
            vec!["enp3s0f0v0".to_string()]
        );
        assert!(nic.vf_interface_names("enp3s0f0", 1).await.unwrap().is_empty());
        assert!(nic.vf_interface_names("enp3s0f0", 5).await.unwrap().is_empty());
    }

    /// A missing ethtool aborts the run instead of failing one rule.
    #[tokio::test]
    async fn test_missing_tool_is_fatal_for_rule_changes() {
        let nic = LinuxNic::new(ToolPaths {
            ethtool: "/nonexistent/ethtool".to_string(),
            ..Default::default()
        });
        let add = nic.add_rule("eth0", &FlowRule::udp(8000, 0)).await.unwrap_err();
        assert!(matches!(add, NicError::ShellExec { .. }));
        assert!(add.is_fatal());
        let delete = nic.delete_rule("eth0", 7).await.unwrap_err();
        assert!(matches!(delete, NicError::ShellExec { .. }));
        assert!(delete.is_fatal());
    }

    /// Older ethtool prints no rule id; the id comes from the listing.
    #[tokio::test]
    async fn test_add_rule_finds_id_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ethtool.sh");
        fs::write(
            &script,
            "case \"$1\" in\n\
             -N) exit 0 ;;\n\
             -n) printf 'Filter: 5\\n\\tRule Type: UDP over IPv4\\n\\tDest port: 8000 mask: 0x0\\n\\tAction: Direct to queue 2\\n' ;;\n\
             esac\n",
        )
        .unwrap();
        let nic = LinuxNic::new(ToolPaths {
            ethtool: format!("/bin/sh {}", script.display()),
            ..Default::default()
        });

        assert_eq!(nic.add_rule("eth0", &FlowRule::udp(8000, 2)).await.unwrap(), 5);
        assert!(matches!(
            nic.add_rule("eth0", &FlowRule::udp(8001, 2)).await,
            Err(NicError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_count_from_sysfs() {
        let (_dir, nic) = fake_sysfs();
        assert_eq!(nic.queue_count_from_sysfs("enp3s0f0").await.unwrap(), Some(2));
        assert_eq!(nic.queue_count_from_sysfs("eth9").await.unwrap(), None);
    }
}
