use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub(crate) const DEFAULT_SSH_RETRIES: u32 = 30;
pub(crate) const DEFAULT_SSH_RETRY_DELAY_SECS: u64 = 10;
pub(crate) const DEFAULT_SSH_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_OS_ID: &str = "flatcar";
pub(crate) const DEFAULT_USER: &str = "core";

/// Per-cluster runtime settings shared by every machine of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory receiving one sub-directory per machine (payload, console, journal).
    pub output_dir: PathBuf,
    /// Number of health-check attempts before giving up.
    pub ssh_retries: u32,
    /// Fixed delay between health-check attempts.
    pub ssh_retry_delay_secs: u64,
    /// Connect timeout of a single SSH round-trip.
    pub ssh_timeout_secs: u64,
    /// Skip the "no unit failed during boot" assertion.
    pub allow_failed_units: bool,
    /// Value the guest must report as `ID=` in `/etc/os-release`.
    pub expected_os_id: String,
    /// Do not merge the fleet SSH key into machine payloads.
    pub no_ssh_key_in_userdata: bool,
    /// Login used for the fleet key credential mode.
    pub default_user: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("_fleet"),
            ssh_retries: DEFAULT_SSH_RETRIES,
            ssh_retry_delay_secs: DEFAULT_SSH_RETRY_DELAY_SECS,
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
            allow_failed_units: false,
            expected_os_id: DEFAULT_OS_ID.to_string(),
            no_ssh_key_in_userdata: false,
            default_user: DEFAULT_USER.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn ssh_retry_delay(&self) -> Duration {
        Duration::from_secs(self.ssh_retry_delay_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Load a config from a YAML file.
    ///
    /// A relative `output_dir` is resolved against the file's parent directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FleetError::InvalidConfig(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_yaml_ng::from_str(&content)
            .map_err(|e| FleetError::InvalidConfig(format!("parse {}: {e}", path.display())))?;
        if config.output_dir.is_relative()
            && let Some(dir) = path.parent()
        {
            config.output_dir = dir.join(&config.output_dir);
        }
        Ok(config)
    }
}

/// Extra knobs for a single machine beyond its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    pub memory_mib: Option<u32>,
    pub cpus: Option<u32>,
    /// Additional block devices, attached after the primary disk in order.
    pub extra_disks: Vec<DiskSpec>,
    pub enable_tpm: bool,
    pub enable_vnc: bool,
    /// Overrides the flight-wide firmware image.
    pub firmware: Option<PathBuf>,
    /// Appended verbatim after the generated arguments.
    pub extra_qemu_args: Vec<String>,
}

/// A block device to materialize before the VM starts.
///
/// Exactly one of `size` and `backing_file` must be set; `extra_size` only
/// makes sense on top of a backing file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    /// Size in bytes of a fresh sparse image.
    pub size: Option<u64>,
    /// Existing image used as copy-on-write base.
    pub backing_file: Option<PathBuf>,
    /// Bytes added on top of the backing image's virtual size.
    pub extra_size: Option<u64>,
    /// Device serial, surfaces in the guest as `/dev/disk/by-id/virtio-<serial>`.
    pub serial: Option<String>,
    /// Extra `-device` options (`key=value`).
    pub device_opts: Vec<String>,
}

/// Validated view of where a disk's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSource<'a> {
    Sized(u64),
    Backed {
        file: &'a Path,
        extra_size: Option<u64>,
    },
}

impl DiskSpec {
    pub fn sized(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn backed(file: impl Into<PathBuf>) -> Self {
        Self {
            backing_file: Some(file.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_extra_size(mut self, extra: u64) -> Self {
        self.extra_size = Some(extra);
        self
    }

    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Reject conflicting combinations before anything touches the disk.
    pub fn validate(&self) -> Result<DiskSource<'_>> {
        match (self.size, self.backing_file.as_deref(), self.extra_size) {
            (Some(_), Some(_), _) => Err(FleetError::DiskSpec(
                "size and backing file are mutually exclusive".into(),
            )),
            (None, None, _) => Err(FleetError::DiskSpec(
                "either size or backing file is required".into(),
            )),
            (Some(_), None, Some(_)) => Err(FleetError::DiskSpec(
                "extra size requires a backing file".into(),
            )),
            (Some(0), None, None) => Err(FleetError::DiskSpec("size must be non-zero".into())),
            (Some(size), None, None) => Ok(DiskSource::Sized(size)),
            (None, Some(file), extra_size) => Ok(DiskSource::Backed { file, extra_size }),
        }
    }

    /// Parse a disk from its command-line form.
    ///
    /// ```text
    ///   5G                         fresh 5 GiB image
    ///   5G:serial=secondary        ... with a stable serial
    ///   base.img+2G:serial=data    copy-on-write over base.img, grown by 2 GiB
    /// ```
    ///
    /// Options other than `serial=` are kept as raw device options.
    pub fn parse(spec: &str) -> Result<Self> {
        let (source, opts) = match spec.split_once(':') {
            Some((source, opts)) => (source, Some(opts)),
            None => (spec, None),
        };
        if source.is_empty() {
            return Err(FleetError::DiskSpec(format!("empty disk source in {spec:?}")));
        }

        let mut disk = match parse_size(source) {
            Some(size) => Self::sized(size),
            None => match source.rsplit_once('+') {
                Some((file, extra)) if !file.is_empty() => {
                    let extra = parse_size(extra).ok_or_else(|| {
                        FleetError::DiskSpec(format!("invalid extra size {extra:?}"))
                    })?;
                    Self::backed(file).with_extra_size(extra)
                }
                _ => Self::backed(source),
            },
        };

        for opt in opts.into_iter().flat_map(|o| o.split(',')) {
            if opt.is_empty() {
                continue;
            }
            match opt.strip_prefix("serial=") {
                Some(serial) if !serial.is_empty() => disk.serial = Some(serial.to_string()),
                Some(_) => return Err(FleetError::DiskSpec("empty serial".into())),
                None => disk.device_opts.push(opt.to_string()),
            }
        }

        disk.validate()?;
        Ok(disk)
    }
}

/// Parse a `qemu-img`-style size (`512`, `64K`, `10M`, `5G`, `1T`) into bytes.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last()? {
        (idx, 'K' | 'k') => (s.get(..idx)?, 10),
        (idx, 'M' | 'm') => (s.get(..idx)?, 20),
        (idx, 'G' | 'g') => (s.get(..idx)?, 30),
        (idx, 'T' | 't') => (s.get(..idx)?, 40),
        _ => (s, 0),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(1u64 << shift)
}
