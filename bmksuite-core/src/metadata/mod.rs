//! Host hardware and software metadata extraction.
//!
//! The extractor runs a fixed set of introspection commands through a
//! [`CommandRunner`] and parses their output. Sections that need root or a
//! specific helper tool degrade to sentinel or empty data when either is
//! missing; collection itself never fails.

pub mod parser;
pub mod value;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::command::{CommandRunner, NOT_AVAILABLE};
use crate::probe::HostProbe;

pub use parser::{
    find_label, label_or_sentinel, parse_bios, parse_cpu, parse_memory_modules, parse_storage,
    parse_system,
};
pub use value::{FieldKind, MetaRecord, MetaValue, coerce, float_or_text, int_or_text};

/// Helper tools probed before collecting privileged sections.
pub const HELPER_TOOLS: [&str; 3] = ["lshw", "ipmitool", "dmidecode"];

/// Hardware sections of the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareMetadata {
    #[serde(rename = "CPU")]
    pub cpu: MetaRecord,
    #[serde(rename = "BIOS")]
    pub bios: MetaRecord,
    #[serde(rename = "SYSTEM")]
    pub system: MetaRecord,
    #[serde(rename = "MEMORY")]
    pub memory: MetaRecord,
    #[serde(rename = "STORAGE")]
    pub storage: MetaRecord,
}

/// Everything the extractor knows about the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetadata {
    #[serde(rename = "SW")]
    pub software: MetaRecord,
    #[serde(rename = "HW")]
    pub hardware: HardwareMetadata,
}

pub struct Extractor {
    runner: Arc<dyn CommandRunner>,
    privileged: bool,
    tools: BTreeMap<&'static str, bool>,
}

impl Extractor {
    /// Probe privilege and helper tools once; the result drives every section.
    pub fn new(runner: Arc<dyn CommandRunner>, probe: &dyn HostProbe) -> Self {
        let privileged = probe.is_privileged();
        if !privileged {
            info!("Not running as super-user, hardware metadata will be incomplete");
        }

        let tools = HELPER_TOOLS
            .iter()
            .map(|tool| (*tool, probe.executable_exists(tool)))
            .collect::<BTreeMap<_, _>>();
        debug!(?tools, "Helper tool availability");

        Self {
            runner,
            privileged,
            tools,
        }
    }

    fn can_use(&self, tool: &str) -> bool {
        self.privileged && self.tools.get(tool).copied().unwrap_or(false)
    }

    /// Run a command only when `tool` is usable, otherwise return the sentinel.
    async fn run_with(&self, tool: &str, command: &str) -> String {
        if self.can_use(tool) {
            self.runner.run(command).await.stdout
        } else {
            debug!(tool, command, "Skipping privileged command");
            NOT_AVAILABLE.to_string()
        }
    }

    pub async fn collect_sw(&self) -> MetaRecord {
        info!("Collecting SW information");

        let commands = [
            ("singularity", "singularity version"),
            ("docker", "docker version --format '{{.Server.Version}}'"),
            ("python_version", "python3 -c 'import platform; print(platform.python_version())'"),
            ("platform", "uname -srm"),
        ];

        let mut software = MetaRecord::new();
        software.insert(
            "bmksuite_version".into(),
            env!("CARGO_PKG_VERSION").into(),
        );
        for (key, command) in commands {
            software.insert(key.into(), self.runner.run(command).await.stdout.into());
        }
        software
    }

    pub async fn collect_cpu(&self) -> MetaRecord {
        info!("Collecting CPU information");

        let mut cpu = parse_cpu(&self.runner.run("lscpu").await.stdout);

        let policy = self
            .runner
            .run("cat /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor | sort | uniq")
            .await;
        let driver = self
            .runner
            .run("cat /sys/devices/system/cpu/cpu*/cpufreq/scaling_driver | sort | uniq")
            .await;
        let microcode = self
            .runner
            .run("grep microcode /proc/cpuinfo | uniq | awk 'NR==1{print $3}'")
            .await;
        let smt = self
            .runner
            .run("cat /sys/devices/system/cpu/smt/active")
            .await;

        cpu.insert("Power_Policy".into(), policy.stdout.into());
        cpu.insert("Power_Driver".into(), driver.stdout.into());
        cpu.insert("Microcode".into(), microcode.stdout.into());
        cpu.insert(
            "SMT_Enabled?".into(),
            MetaValue::Bool(smt.success() && smt.stdout.trim() == "1"),
        );
        cpu
    }

    pub async fn collect_bios(&self) -> MetaRecord {
        info!("Collecting BIOS information");
        parse_bios(&self.run_with("dmidecode", "dmidecode -t bios").await)
    }

    pub async fn collect_system(&self) -> MetaRecord {
        info!("Collecting system information");
        let system = self.run_with("dmidecode", "dmidecode -t system").await;
        let fru = self.run_with("ipmitool", "ipmitool fru").await;
        parse_system(&system, &fru)
    }

    pub async fn collect_memory(&self) -> MetaRecord {
        info!("Collecting system memory");

        let mut memory = if self.can_use("dmidecode") {
            parse_memory_modules(&self.runner.run("dmidecode -t 17").await.stdout)
        } else {
            MetaRecord::new()
        };

        for (key, row, column) in [
            ("Mem_Total", 2, 2),
            ("Mem_Available", 2, 7),
            ("Mem_Swap", 3, 2),
        ] {
            let stages = vec![
                vec!["free".to_string()],
                vec!["awk".to_string(), format!("NR=={row}{{print ${column}}}")],
            ];
            let raw = self.runner.run_pipeline(&stages).await.stdout;
            memory.insert(key.into(), int_or_text(key, &raw));
        }
        memory
    }

    pub async fn collect_storage(&self) -> MetaRecord {
        info!("Collecting system storage");
        if self.can_use("lshw") {
            parse_storage(&self.runner.run("lshw -c disk").await.stdout)
        } else {
            MetaRecord::new()
        }
    }

    pub async fn collect_hw(&self) -> HardwareMetadata {
        info!("Collecting HW information");
        HardwareMetadata {
            cpu: self.collect_cpu().await,
            bios: self.collect_bios().await,
            system: self.collect_system().await,
            memory: self.collect_memory().await,
            storage: self.collect_storage().await,
        }
    }

    /// Collect software and hardware metadata.
    pub async fn collect(&self) -> HostMetadata {
        info!("Collecting the full metadata information");
        HostMetadata {
            software: self.collect_sw().await,
            hardware: self.collect_hw().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &str) -> CommandOutput {
            self.seen.lock().unwrap().push(command.to_string());
            CommandOutput {
                stdout: "1".into(),
                exit_code: 0,
            }
        }

        async fn run_pipeline(&self, stages: &[Vec<String>]) -> CommandOutput {
            self.seen.lock().unwrap().push(stages[0].join(" "));
            CommandOutput {
                stdout: "1024".into(),
                exit_code: 0,
            }
        }

        async fn run_streaming(&self, _command: &str) -> i32 {
            0
        }
    }

    struct Probe {
        root: bool,
    }

    impl HostProbe for Probe {
        fn is_privileged(&self) -> bool {
            self.root
        }
        fn executable_exists(&self, _name: &str) -> bool {
            true
        }
        fn free_disk_bytes(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    #[tokio::test]
    async fn test_unprivileged_skips_dmidecode() {
        let runner = Arc::new(RecordingRunner::default());
        let extractor = Extractor::new(runner.clone(), &Probe { root: false });

        let bios = extractor.collect_bios().await;
        assert_eq!(bios["Vendor"], MetaValue::not_available());
        let memory = extractor.collect_memory().await;
        assert_eq!(memory.len(), 3);
        assert_eq!(memory["Mem_Total"], MetaValue::Int(1024));

        let seen = runner.seen.lock().unwrap();
        assert!(seen.iter().all(|c| !c.starts_with("dmidecode")));
    }

    #[tokio::test]
    async fn test_privileged_runs_dmidecode() {
        let runner = Arc::new(RecordingRunner::default());
        let extractor = Extractor::new(runner.clone(), &Probe { root: true });
        extractor.collect_bios().await;
        assert!(
            runner
                .seen
                .lock()
                .unwrap()
                .contains(&"dmidecode -t bios".to_string())
        );
    }

    #[tokio::test]
    async fn test_smt_flag() {
        let runner = Arc::new(RecordingRunner::default());
        let extractor = Extractor::new(runner, &Probe { root: false });
        let cpu = extractor.collect_cpu().await;
        assert_eq!(cpu["SMT_Enabled?"], MetaValue::Bool(true));
    }
}
