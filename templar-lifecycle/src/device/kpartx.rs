//! Parser for `kpartx -av` output.

use std::path::PathBuf;

use templar_hypervisor::ParseError;

/// One `add map` line of `kpartx -av`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    /// Device-mapper name, e.g. `pve-vm--9000--disk--0p1`
    pub name: String,
}

impl PartitionMap {
    /// Path of the mapped partition node.
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }

    /// True for the first partition of the table.
    pub fn is_first(&self) -> bool {
        self.name.ends_with("p1")
    }
}

/// Parse `kpartx -av`, e.g.
/// `add map pve-vm--9000--disk--0p1 (253:7): 0 4384735 linear 253:6 227328`.
///
/// A disk without a partition table produces no output at all.
pub fn parse_kpartx_add(output: &str) -> Result<Vec<PartitionMap>, ParseError> {
    const CMD: &str = "kpartx -av";

    output
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(idx, line)| {
            line.trim()
                .strip_prefix("add map ")
                .and_then(|rest| rest.split_whitespace().next())
                .map(|name| PartitionMap { name: name.to_string() })
                .ok_or_else(|| ParseError::Row {
                    source_cmd: CMD,
                    line_no: idx + 1,
                    line: line.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kpartx_add() {
        let out = "\
add map pve-vm--9000--disk--0p1 (253:7): 0 4384735 linear 253:6 227328
add map pve-vm--9000--disk--0p14 (253:8): 0 8192 linear 253:6 2048
add map pve-vm--9000--disk--0p15 (253:9): 0 217088 linear 253:6 10240
";
        let maps = parse_kpartx_add(out).unwrap();
        assert_eq!(maps.len(), 3);
        assert!(maps[0].is_first());
        assert!(!maps[1].is_first());
        assert_eq!(maps[0].path(), PathBuf::from("/dev/mapper/pve-vm--9000--disk--0p1"));
    }

    #[test]
    fn test_parse_kpartx_no_partitions() {
        assert!(parse_kpartx_add("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_kpartx_garbage() {
        let err = parse_kpartx_add("read error, sector 0\n").unwrap_err();
        assert!(matches!(err, ParseError::Row { line_no: 1, .. }));
    }
}
