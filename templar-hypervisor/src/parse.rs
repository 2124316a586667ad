//! Typed parsers for `qm` and `pvesm` text output.
//!
//! Every parser either returns structured values or a [`ParseError`] naming
//! the offending line, so the classification logic above it can be tested
//! without a live host.

use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::storage::PoolStatus;
use crate::types::{VmConfig, VmId, VmRunState, VmSummary};

/// Parse `pvesm status`. Capacity columns are KiB and converted to bytes.
pub fn parse_pvesm_status(output: &str) -> Result<Vec<PoolStatus>, ParseError> {
    const CMD: &str = "pvesm status";
    let mut lines = output.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines.next().ok_or(ParseError::Header {
        source_cmd: CMD,
        line: String::new(),
    })?;
    let columns: Vec<&str> = header.split_whitespace().collect();
    if columns.len() < 6 || columns[0] != "Name" || columns[1] != "Type" || columns[2] != "Status" {
        return Err(ParseError::Header {
            source_cmd: CMD,
            line: header.to_string(),
        });
    }

    let mut pools = Vec::new();
    for (idx, line) in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(ParseError::Row {
                source_cmd: CMD,
                line_no: idx + 1,
                line: line.to_string(),
            });
        }
        pools.push(PoolStatus {
            name: fields[0].to_string(),
            backend_type: fields[1].to_string(),
            active: fields[2] == "active",
            total_bytes: kib_field("total", fields[3])?,
            used_bytes: kib_field("used", fields[4])?,
            available_bytes: kib_field("available", fields[5])?,
        });
    }

    Ok(pools)
}

fn kib_field(field: &'static str, value: &str) -> Result<u64, ParseError> {
    value
        .parse::<u64>()
        .map(|kib| kib.saturating_mul(1024))
        .map_err(|_| ParseError::Number { field, value: value.to_string() })
}

/// Parse `qm list`.
pub fn parse_qm_list(output: &str) -> Result<Vec<VmSummary>, ParseError> {
    const CMD: &str = "qm list";
    let mut lines = output.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        // No VMs on the host: qm prints nothing at all.
        return Ok(Vec::new());
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    if columns.len() < 3 || columns[0] != "VMID" || columns[1] != "NAME" || columns[2] != "STATUS" {
        return Err(ParseError::Header {
            source_cmd: CMD,
            line: header.to_string(),
        });
    }

    lines
        .map(|(idx, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(ParseError::Row {
                    source_cmd: CMD,
                    line_no: idx + 1,
                    line: line.to_string(),
                });
            }
            Ok(VmSummary {
                vm_id: fields[0].parse::<VmId>()?,
                name: fields[1].to_string(),
                run_state: VmRunState::from_status_word(fields[2]),
            })
        })
        .collect()
}

/// Parse `qm config <vmid>` into the current configuration.
///
/// Description comment lines (`#...`) are skipped and parsing stops at the
/// first snapshot or pending section header.
pub fn parse_qm_config(output: &str) -> Result<VmConfig, ParseError> {
    const CMD: &str = "qm config";
    let mut entries = BTreeMap::new();

    for (idx, line) in output.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') {
            break;
        }
        let (key, value) = trimmed
            .split_once(':')
            .filter(|(k, _)| !k.is_empty() && !k.contains(char::is_whitespace))
            .ok_or_else(|| ParseError::Row {
                source_cmd: CMD,
                line_no: idx + 1,
                line: line.to_string(),
            })?;
        entries.insert(key.to_string(), value.trim().to_string());
    }

    Ok(VmConfig { entries })
}

/// Parse `qm status <vmid>` (`status: running`).
pub fn parse_qm_status(output: &str) -> Result<VmRunState, ParseError> {
    const CMD: &str = "qm status";
    let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    match line.trim().split_once(':') {
        Some(("status", word)) => Ok(VmRunState::from_status_word(word)),
        _ => Err(ParseError::Row {
            source_cmd: CMD,
            line_no: 1,
            line: line.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PVESM_STATUS: &str = "\
Name             Type     Status           Total            Used       Available        %
local             dir     active        98497780        10403612        83044620   10.56%
local-lvm     lvmthin     active       832888832        26239598       806649233    3.15%
tank          zfspool   inactive               0               0               0    0.00%
";

    #[test]
    fn test_parse_pvesm_status() {
        let pools = parse_pvesm_status(PVESM_STATUS).unwrap();
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[0].name, "local");
        assert_eq!(pools[0].backend_type, "dir");
        assert!(pools[0].active);
        assert_eq!(pools[0].total_bytes, 98497780 * 1024);
        assert_eq!(pools[1].backend_type, "lvmthin");
        assert!(!pools[2].active);
    }

    #[test]
    fn test_parse_pvesm_status_bad_header() {
        let err = parse_pvesm_status("storage listing unavailable\n").unwrap_err();
        assert!(matches!(err, ParseError::Header { .. }));
    }

    #[test]
    fn test_parse_pvesm_status_bad_number() {
        let out = "Name Type Status Total Used Available %\nlocal dir active lots 1 1 1%\n";
        let err = parse_pvesm_status(out).unwrap_err();
        assert_eq!(err, ParseError::Number { field: "total", value: "lots".into() });
    }

    #[test]
    fn test_parse_qm_list() {
        let out = "\
      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID
       301 web-1                running    2048              32.00 12345
      9000 ubuntu-22.04-standard stopped    2048               2.20 0
";
        let vms = parse_qm_list(out).unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].vm_id, VmId(301));
        assert_eq!(vms[0].name, "web-1");
        assert!(vms[0].run_state.is_running());
        assert_eq!(vms[1].name, "ubuntu-22.04-standard");
        assert_eq!(vms[1].run_state, VmRunState::Stopped);
    }

    #[test]
    fn test_parse_qm_list_empty_host() {
        assert!(parse_qm_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_qm_config() {
        let out = "\
#Built from ubuntu cloud image
boot: order=scsi0
cores: 2
name: web-1
scsi0: local-lvmthin:base-9000-disk-0/vm-301-disk-0,size=2252M
scsihw: virtio-scsi-pci

[snap1]
scsi0: local-lvmthin:vm-301-disk-1,size=2252M
";
        let config = parse_qm_config(out).unwrap();
        assert_eq!(config.name(), Some("web-1"));
        assert_eq!(
            config.get("scsi0"),
            Some("local-lvmthin:base-9000-disk-0/vm-301-disk-0,size=2252M")
        );
        assert_eq!(config.disks().count(), 1);
        assert!(!config.is_template());
    }

    #[test]
    fn test_parse_qm_config_rejects_garbage() {
        let err = parse_qm_config("cores: 2\nthis is not a config line\n").unwrap_err();
        assert!(matches!(err, ParseError::Row { line_no: 2, .. }));
    }

    #[test]
    fn test_parse_qm_status() {
        assert_eq!(parse_qm_status("status: running\n").unwrap(), VmRunState::Running);
        assert_eq!(parse_qm_status("status: stopped\n").unwrap(), VmRunState::Stopped);
        assert!(parse_qm_status("Configuration file does not exist\n").is_err());
    }
}
