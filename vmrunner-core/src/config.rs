//! VM configuration and the HCS schema 2 document rendered from it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CoreError, VmId};

/// Default kernel command line for the utility VM image.
pub const DEFAULT_KERNEL_ARGS: &str = "console=ttyS0 root=/dev/sda rw init=/sbin/init";

/// Default image directory on the build host.
pub const DEFAULT_IMAGE_DIR: &str = r"C:\source\hcsshim\vm-image";

/// Owner string recorded in every document this crate produces.
const DOCUMENT_OWNER: &str = "vmrunner";

/// User-facing options for creating a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmConfig {
    /// Directory holding `vmlinuz`, `initrd` and `rootfs.vhdx`.
    pub image_dir: String,

    /// Memory size in megabytes.
    pub memory_mb: u32,

    /// Number of virtual processors.
    pub cpu_count: u32,

    /// Kernel command line. Empty means [`DEFAULT_KERNEL_ARGS`].
    pub kernel_args: String,

    /// Identifier of the compute system.
    pub vm_id: VmId,

    /// Pipe backing COM1. `None` derives it from `vm_id`.
    pub pipe_name: Option<String>,
}

impl VmConfig {
    /// Create a config for `vm_id` with default sizing.
    #[must_use]
    pub fn new(vm_id: VmId, image_dir: impl Into<String>) -> Self {
        Self {
            image_dir: image_dir.into(),
            memory_mb: 2048,
            cpu_count: 2,
            kernel_args: String::new(),
            vm_id,
            pipe_name: None,
        }
    }

    /// Name of the console pipe the document binds to COM port 0.
    #[must_use]
    pub fn console_pipe_name(&self) -> String {
        self.pipe_name
            .clone()
            .unwrap_or_else(|| self.vm_id.console_pipe_name())
    }

    /// Render the configuration document consumed by compute system creation.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] if the image directory is empty or
    /// the topology is zero-sized, and [`CoreError::Serialize`] if encoding
    /// fails.
    pub fn to_document(&self) -> Result<String, CoreError> {
        if self.image_dir.is_empty() {
            return Err(CoreError::InvalidConfig {
                field: "image_dir".to_owned(),
                reason: "image directory must not be empty".to_owned(),
            });
        }
        if self.memory_mb == 0 {
            return Err(CoreError::InvalidConfig {
                field: "memory_mb".to_owned(),
                reason: "memory size must be non-zero".to_owned(),
            });
        }
        if self.cpu_count == 0 {
            return Err(CoreError::InvalidConfig {
                field: "cpu_count".to_owned(),
                reason: "processor count must be non-zero".to_owned(),
            });
        }

        let kernel_args = if self.kernel_args.is_empty() {
            DEFAULT_KERNEL_ARGS
        } else {
            &self.kernel_args
        };

        let doc = Document {
            owner: DOCUMENT_OWNER,
            schema_version: SchemaVersion { major: 2, minor: 1 },
            virtual_machine: VirtualMachine {
                chipset: Chipset {
                    linux_kernel_direct: LinuxKernelDirect {
                        kernel_file_path: image_path(&self.image_dir, "vmlinuz"),
                        init_rd_path: image_path(&self.image_dir, "initrd"),
                        kernel_cmd_line: kernel_args.to_owned(),
                    },
                },
                compute_topology: ComputeTopology {
                    memory: Memory { size_in_mb: self.memory_mb },
                    processor: Processor { count: self.cpu_count },
                },
                devices: Devices {
                    scsi: BTreeMap::from([(
                        "0".to_owned(),
                        ScsiController {
                            attachments: BTreeMap::from([(
                                "0".to_owned(),
                                ScsiAttachment {
                                    kind: "VirtualDisk",
                                    path: image_path(&self.image_dir, "rootfs.vhdx"),
                                },
                            )]),
                        },
                    )]),
                    com_ports: BTreeMap::from([(
                        "0".to_owned(),
                        ComPort { named_pipe: self.console_pipe_name() },
                    )]),
                },
            },
        };

        Ok(serde_json::to_string(&doc)?)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new(VmId::default(), DEFAULT_IMAGE_DIR)
    }
}

/// Join an image file name onto `dir`.
///
/// Drive-letter and UNC directories are joined with a backslash regardless
/// of the host the document is rendered on.
fn image_path(dir: &str, file: &str) -> String {
    if dir.ends_with('\\') {
        return format!("{dir}{file}");
    }
    if is_windows_path(dir) {
        return format!(r"{dir}\{file}");
    }
    Path::new(dir).join(file).to_string_lossy().into_owned()
}

fn is_windows_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    (bytes.len() >= 2 && bytes[1] == b':') || path.starts_with(r"\\")
}

// ── HCS schema 2 document ─────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Document {
    owner: &'static str,
    schema_version: SchemaVersion,
    virtual_machine: VirtualMachine,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SchemaVersion {
    major: u32,
    minor: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VirtualMachine {
    chipset: Chipset,
    compute_topology: ComputeTopology,
    devices: Devices,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Chipset {
    linux_kernel_direct: LinuxKernelDirect,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LinuxKernelDirect {
    kernel_file_path: String,
    init_rd_path: String,
    kernel_cmd_line: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ComputeTopology {
    memory: Memory,
    processor: Processor,
}

#[derive(Serialize)]
struct Memory {
    #[serde(rename = "SizeInMB")]
    size_in_mb: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Processor {
    count: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Devices {
    scsi: BTreeMap<String, ScsiController>,
    com_ports: BTreeMap<String, ComPort>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ScsiController {
    attachments: BTreeMap<String, ScsiAttachment>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ScsiAttachment {
    #[serde(rename = "Type")]
    kind: &'static str,
    path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ComPort {
    named_pipe: String,
}
