//! Text parsers for system introspection output.
//!
//! Every parser is total: a missing label yields the `not_available`
//! sentinel for that field only, and malformed repeated blocks are dropped
//! as a whole instead of producing partial records.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, error, warn};

use super::value::{FieldKind, MetaRecord, MetaValue, coerce};
use crate::command::NOT_AVAILABLE;

/// Labels read from `lscpu`, in report key order.
const CPU_FIELDS: &[(&str, &str, FieldKind)] = &[
    ("Architecture", "Architecture", FieldKind::Text),
    ("CPU_Model", "Model name", FieldKind::Text),
    ("CPU_Family", "CPU family", FieldKind::Text),
    ("CPU_num", "CPU(s)", FieldKind::Int),
    ("Online_CPUs_list", "On-line CPU(s) list", FieldKind::Text),
    ("Threads_per_core", "Thread(s) per core", FieldKind::Int),
    ("Cores_per_socket", "Core(s) per socket", FieldKind::Int),
    ("Sockets", "Socket(s)", FieldKind::Int),
    ("Vendor_ID", "Vendor ID", FieldKind::Text),
    ("Stepping", "Stepping", FieldKind::Int),
    ("CPU_MHz", "CPU MHz", FieldKind::Float),
    ("CPU_Max_Speed_MHz", "CPU max MHz", FieldKind::Float),
    ("CPU_Min_Speed_MHz", "CPU min MHz", FieldKind::Float),
    ("BogoMIPS", "BogoMIPS", FieldKind::Float),
    ("L2_cache", "L2 cache", FieldKind::Text),
    ("L3_cache", "L3 cache", FieldKind::Text),
    ("NUMA_nodes", "NUMA node(s)", FieldKind::Int),
];

/// Values dmidecode prints for empty DIMM slots.
const ABSENT_MODULE_MARKERS: &[&str] = &["No Module Installed", "NO DIMM", "Unknown"];

/// One `label: value` line. The label stops at the first colon and a value
/// must hold at least one non-blank character.
static LABEL_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([^:\n]+?)[ \t]*:[ \t]*(\S.*?)[ \t]*$")
        .map_err(|e| error!(error = %e, "Invalid label line pattern"))
        .ok()
});

/// Find the value printed after `label:` on its own line.
///
/// Labels are compared whole, so `CPU(s)` does not pick up
/// `NUMA node0 CPU(s)`. Padding before the colon is accepted, which covers
/// the `ipmitool fru` layout.
pub fn find_label(text: &str, label: &str) -> Option<String> {
    let value = LABEL_LINE
        .as_ref()?
        .captures_iter(text)
        .find(|caps| caps.get(1).is_some_and(|key| key.as_str() == label))
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string());
    debug!(label, value = value.as_deref().unwrap_or("None"), "Parsed label");
    value
}

/// Like [`find_label`], substituting the sentinel on a miss.
pub fn label_or_sentinel(text: &str, label: &str) -> String {
    find_label(text, label).unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// Parse `lscpu` output, including one `NUMA_node{i}_CPUs` field per node.
pub fn parse_cpu(text: &str) -> MetaRecord {
    let mut cpu = MetaRecord::new();
    for (key, label, kind) in CPU_FIELDS {
        let raw = label_or_sentinel(text, label);
        cpu.insert((*key).to_string(), coerce(key, &raw, *kind));
    }

    match cpu.get("NUMA_nodes").and_then(MetaValue::as_i64) {
        Some(nodes) if nodes >= 0 => {
            for i in 0..nodes {
                let raw = label_or_sentinel(text, &format!("NUMA node{i} CPU(s)"));
                cpu.insert(format!("NUMA_node{i}_CPUs"), MetaValue::Text(raw));
            }
        }
        _ => warn!("Failed to parse or NUMA nodes not existent"),
    }

    cpu
}

/// Fields of the `dmidecode -t bios` section.
pub fn parse_bios(text: &str) -> MetaRecord {
    [
        ("Vendor", "Vendor"),
        ("Version", "Version"),
        ("Release_data", "Release Date"),
    ]
    .into_iter()
    .map(|(key, label)| (key.to_string(), label_or_sentinel(text, label).into()))
    .collect()
}

/// Fields of `dmidecode -t system` merged with the BMC field replaceable unit dump.
pub fn parse_system(system_text: &str, fru_text: &str) -> MetaRecord {
    let mut system: MetaRecord = [
        ("Manufacturer", "Manufacturer"),
        ("Product_Name", "Product Name"),
        ("Version", "Version"),
    ]
    .into_iter()
    .map(|(key, label)| {
        (
            key.to_string(),
            label_or_sentinel(system_text, label).into(),
        )
    })
    .collect();

    for (key, label) in [
        ("Product_Serial", "Product Serial"),
        ("Product_Asset_Tag", "Product Asset Tag"),
    ] {
        system.insert(key.to_string(), label_or_sentinel(fru_text, label).into());
    }
    system
}

/// Split text into blocks, each starting at a line accepted by `is_header`.
/// Text before the first header is discarded.
fn split_blocks<'a>(text: &'a str, is_header: impl Fn(&str) -> bool) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<Vec<&'a str>> = None;

    for line in text.lines() {
        if is_header(line) {
            if let Some(lines) = current.take() {
                blocks.push(lines.join("\n"));
            }
            current = Some(vec![line]);
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current {
        blocks.push(lines.join("\n"));
    }
    blocks
}

fn is_absent(value: &str) -> bool {
    ABSENT_MODULE_MARKERS
        .iter()
        .any(|marker| value.starts_with(marker))
}

/// Parse `dmidecode -t 17` into `dimm1..dimmN` in listing order.
///
/// A slot is kept only when size, type, manufacturer and part number are all
/// present and none of them carries an empty-slot marker.
pub fn parse_memory_modules(text: &str) -> MetaRecord {
    let blocks = split_blocks(text, |line| line.starts_with("Handle "));

    blocks
        .iter()
        .filter_map(|block| {
            let size = find_label(block, "Size")?;
            let typ = find_label(block, "Type")?;
            let manufacturer = find_label(block, "Manufacturer")?;
            let part = find_label(block, "Part Number")?;

            if [&size, &typ, &manufacturer, &part]
                .iter()
                .any(|v| is_absent(v))
            {
                debug!(size = %size, "Skipping empty memory slot");
                return None;
            }
            Some(format!("{size} {typ} | {manufacturer} | {part}"))
        })
        .enumerate()
        .map(|(i, dimm)| (format!("dimm{}", i + 1), MetaValue::Text(dimm)))
        .collect()
}

/// Parse `lshw -c disk` into `disk1..diskN` in listing order.
///
/// Devices without a logical name, product or size (e.g. empty optical
/// drives) are skipped.
pub fn parse_storage(text: &str) -> MetaRecord {
    let blocks = split_blocks(text, |line| line.trim_start().starts_with("*-"));

    blocks
        .iter()
        .filter_map(|block| {
            let logical = find_label(block, "logical name")?;
            let product = find_label(block, "product")?;
            let size = find_label(block, "size")?;
            Some(format!("{logical} | {product} | {size}"))
        })
        .enumerate()
        .map(|(i, disk)| (format!("disk{}", i + 1), MetaValue::Text(disk)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_label_anchored() {
        let text = "CPU(s):              4\nNUMA node0 CPU(s):   0-3\n";
        assert_eq!(find_label(text, "CPU(s)").as_deref(), Some("4"));
        assert_eq!(find_label(text, "NUMA node0 CPU(s)").as_deref(), Some("0-3"));
        assert_eq!(find_label(text, "NUMA node1 CPU(s)"), None);
    }

    #[test]
    fn test_label_with_padding_before_colon() {
        let fru = " Product Serial        : BQWL32700130\n Product Asset Tag     : CERN-1234\n";
        assert_eq!(label_or_sentinel(fru, "Product Serial"), "BQWL32700130");
        assert_eq!(label_or_sentinel(fru, "Product Asset Tag"), "CERN-1234");
        assert_eq!(label_or_sentinel(fru, "Board Serial"), NOT_AVAILABLE);
    }

    #[test]
    fn test_values_keep_their_colons() {
        assert!(LABEL_LINE.is_some());
        let text = "BIOS Revision: 5.17\nBoot time: 10:42:07\nRelease Date: 12/03/2021\n";
        assert_eq!(find_label(text, "Boot time").as_deref(), Some("10:42:07"));
        assert_eq!(find_label(text, "Release Date").as_deref(), Some("12/03/2021"));
        assert_eq!(find_label(text, "Boot"), None);
    }

    #[test]
    fn test_empty_value_is_missing() {
        assert_eq!(find_label("Vendor:   \nVersion: 1\n", "Vendor"), None);
    }

    #[test]
    fn test_cpu_without_numa_keeps_fixed_keys() {
        let cpu = parse_cpu("Architecture: aarch64\n");
        assert_eq!(cpu.len(), CPU_FIELDS.len());
        assert_eq!(cpu["Architecture"], MetaValue::Text("aarch64".into()));
        assert_eq!(cpu["NUMA_nodes"], MetaValue::not_available());
    }

    #[test]
    fn test_split_blocks_discards_preamble() {
        let blocks = split_blocks("# dmidecode\nHandle 1\na\nHandle 2\nb", |l| {
            l.starts_with("Handle ")
        });
        assert_eq!(blocks, vec!["Handle 1\na", "Handle 2\nb"]);
    }
}
