//! Boot-time guest payloads.
//!
//! The payload itself is produced elsewhere; this module only needs to know
//! its shape well enough to merge cluster-wide defaults into it and to pick
//! how it reaches the guest.

use serde_json::{Map, Value as Json, json};
use serde_yaml_ng::{Mapping, Value as Yaml};
use tracing::warn;

use crate::error::{FleetError, Result};

const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
const DEFAULT_IGNITION_VERSION: &str = "3.3.0";

/// How a rendered payload is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTransport {
    /// `ignition.json` through the firmware-config channel.
    FirmwareConfig,
    /// `config-2/openstack/latest/user_data` through a 9p mount.
    ConfigDrive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUserData {
    pub bytes: Vec<u8>,
    pub transport: PayloadTransport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserData {
    Ignition(Json),
    CloudConfig(Yaml),
    Script(String),
}

impl Default for UserData {
    fn default() -> Self {
        Self::Ignition(json!({ "ignition": { "version": DEFAULT_IGNITION_VERSION } }))
    }
}

impl UserData {
    /// Detect the payload shape from its text.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if trimmed.starts_with(CLOUD_CONFIG_HEADER) {
            let value: Yaml = serde_yaml_ng::from_str(trimmed)
                .map_err(|e| FleetError::InvalidConfig(format!("cloud-config: {e}")))?;
            let value = match value {
                Yaml::Null => Yaml::Mapping(Mapping::new()),
                Yaml::Mapping(m) => Yaml::Mapping(m),
                _ => {
                    return Err(FleetError::InvalidConfig(
                        "cloud-config must be a mapping".into(),
                    ));
                }
            };
            return Ok(Self::CloudConfig(value));
        }
        if trimmed.starts_with("#!") {
            return Ok(Self::Script(text.to_string()));
        }
        let value: Json = serde_json::from_str(trimmed)
            .map_err(|e| FleetError::InvalidConfig(format!("ignition: {e}")))?;
        if value.pointer("/ignition/version").and_then(Json::as_str).is_none() {
            return Err(FleetError::InvalidConfig(
                "ignition config is missing ignition.version".into(),
            ));
        }
        Ok(Self::Ignition(value))
    }

    pub fn transport(&self) -> PayloadTransport {
        match self {
            Self::Ignition(_) => PayloadTransport::FirmwareConfig,
            Self::CloudConfig(_) | Self::Script(_) => PayloadTransport::ConfigDrive,
        }
    }

    pub fn add_ssh_keys(&mut self, user: &str, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        match self {
            Self::Ignition(v) => ignition_add_ssh_keys(v, user, keys),
            Self::CloudConfig(v) => {
                if let Some(seq) = yaml_seq(v, "ssh_authorized_keys") {
                    seq.extend(keys.iter().map(|k| Yaml::from(k.as_str())));
                }
            }
            Self::Script(_) => warn!("cannot add ssh keys to a script payload"),
        }
    }

    pub fn add_file(&mut self, path: &str, contents: &str, mode: u32) {
        match self {
            Self::Ignition(v) => ignition_add_file(v, path, contents, mode),
            Self::CloudConfig(v) => {
                if let Some(seq) = yaml_seq(v, "write_files") {
                    let mut file = Mapping::new();
                    file.insert("path".into(), path.into());
                    file.insert("content".into(), contents.into());
                    file.insert("permissions".into(), format!("0{mode:o}").into());
                    seq.push(Yaml::Mapping(file));
                }
            }
            Self::Script(_) => warn!(path, "cannot add a file to a script payload"),
        }
    }

    pub fn add_systemd_unit(&mut self, name: &str, contents: &str, enable: bool) {
        match self {
            Self::Ignition(v) => ignition_add_unit(v, name, contents, enable),
            Self::CloudConfig(v) => {
                let units = match v {
                    Yaml::Mapping(root) => {
                        if !matches!(root.get("coreos"), Some(Yaml::Mapping(_))) {
                            root.insert("coreos".into(), Yaml::Mapping(Mapping::new()));
                        }
                        root.get_mut("coreos").and_then(|c| yaml_seq(c, "units"))
                    }
                    _ => None,
                };
                if let Some(units) = units {
                    let mut unit = Mapping::new();
                    unit.insert("name".into(), name.into());
                    unit.insert("content".into(), contents.into());
                    unit.insert("enable".into(), enable.into());
                    if enable {
                        unit.insert("command".into(), "start".into());
                    }
                    units.push(Yaml::Mapping(unit));
                }
            }
            Self::Script(_) => warn!(unit = name, "cannot add a unit to a script payload"),
        }
    }

    pub fn render(&self) -> Result<RenderedUserData> {
        let bytes = match self {
            Self::Ignition(v) => serde_json::to_vec(v)
                .map_err(|e| FleetError::InvalidConfig(format!("render ignition: {e}")))?,
            Self::CloudConfig(v) => {
                let body = serde_yaml_ng::to_string(v)
                    .map_err(|e| FleetError::InvalidConfig(format!("render cloud-config: {e}")))?;
                format!("{CLOUD_CONFIG_HEADER}\n{body}").into_bytes()
            }
            Self::Script(s) => s.clone().into_bytes(),
        };
        Ok(RenderedUserData {
            bytes,
            transport: self.transport(),
        })
    }
}

fn ignition_is_v2(v: &Json) -> bool {
    v.pointer("/ignition/version")
        .and_then(Json::as_str)
        .is_some_and(|ver| ver.starts_with("2."))
}

/// Walk `keys` from the root, creating objects as needed, and return the array at the end.
fn json_array<'a>(v: &'a mut Json, keys: &[&str]) -> Option<&'a mut Vec<Json>> {
    let (last, parents) = keys.split_last()?;
    let mut cur = v;
    for key in parents {
        cur = cur
            .as_object_mut()?
            .entry(*key)
            .or_insert_with(|| Json::Object(Map::new()));
    }
    let slot = cur
        .as_object_mut()?
        .entry(*last)
        .or_insert_with(|| Json::Array(Vec::new()));
    slot.as_array_mut()
}

fn ignition_add_ssh_keys(v: &mut Json, user: &str, keys: &[String]) {
    let Some(users) = json_array(v, &["passwd", "users"]) else {
        warn!("malformed ignition passwd section, ssh keys not added");
        return;
    };
    let existing = users
        .iter_mut()
        .find(|u| u.get("name").and_then(Json::as_str) == Some(user));
    match existing {
        Some(entry) => {
            if let Some(list) = json_array(entry, &["sshAuthorizedKeys"]) {
                list.extend(keys.iter().map(|k| Json::from(k.as_str())));
            }
        }
        None => users.push(json!({ "name": user, "sshAuthorizedKeys": keys })),
    }
}

fn ignition_add_file(v: &mut Json, path: &str, contents: &str, mode: u32) {
    let v2 = ignition_is_v2(v);
    let source = format!(
        "data:,{}",
        percent_encode(contents.as_bytes())
    );
    let mut file = json!({
        "path": path,
        "mode": mode,
        "contents": { "source": source },
    });
    if v2 {
        file["filesystem"] = json!("root");
    } else {
        file["overwrite"] = json!(true);
    }
    match json_array(v, &["storage", "files"]) {
        Some(files) => files.push(file),
        None => warn!(path, "malformed ignition storage section, file not added"),
    }
}

fn ignition_add_unit(v: &mut Json, name: &str, contents: &str, enable: bool) {
    let key = if ignition_is_v2(v) { "enable" } else { "enabled" };
    let mut unit = json!({ "name": name, "contents": contents });
    unit[key] = json!(enable);
    match json_array(v, &["systemd", "units"]) {
        Some(units) => units.push(unit),
        None => warn!(unit = name, "malformed ignition systemd section, unit not added"),
    }
}

fn yaml_seq<'a>(v: &'a mut Yaml, key: &str) -> Option<&'a mut Vec<Yaml>> {
    let map = v.as_mapping_mut()?;
    if !matches!(map.get(key), Some(Yaml::Sequence(_))) {
        map.insert(key.into(), Yaml::Sequence(Vec::new()));
    }
    match map.get_mut(key) {
        Some(Yaml::Sequence(seq)) => Some(seq),
        _ => None,
    }
}

/// RFC 3986 percent-encoding for `data:` URLs.
fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_detects_shapes() {
        assert!(matches!(UserData::parse("").unwrap(), UserData::Ignition(_)));
        assert!(matches!(
            UserData::parse("#cloud-config\nhostname: a\n").unwrap(),
            UserData::CloudConfig(_)
        ));
        assert!(matches!(
            UserData::parse("#!/bin/bash\necho hi\n").unwrap(),
            UserData::Script(_)
        ));
        assert!(matches!(
            UserData::parse(r#"{"ignition":{"version":"3.3.0"}}"#).unwrap(),
            UserData::Ignition(_)
        ));
    }

    #[test]
    fn parse_rejects_ignition_without_version() {
        assert!(UserData::parse(r#"{"storage":{}}"#).is_err());
    }

    #[test]
    fn transport_follows_shape() {
        assert_eq!(
            UserData::default().transport(),
            PayloadTransport::FirmwareConfig
        );
        assert_eq!(
            UserData::parse("#cloud-config\n").unwrap().transport(),
            PayloadTransport::ConfigDrive
        );
    }

    #[test]
    fn ignition_ssh_keys_merge_into_existing_user() {
        let mut ud = UserData::parse(
            r#"{"ignition":{"version":"3.3.0"},"passwd":{"users":[{"name":"core","sshAuthorizedKeys":["key-a"]}]}}"#,
        )
        .unwrap();
        ud.add_ssh_keys("core", &["key-b".to_string()]);
        let UserData::Ignition(v) = ud else {
            panic!("shape changed")
        };
        assert_eq!(
            v.pointer("/passwd/users/0/sshAuthorizedKeys").unwrap(),
            &json!(["key-a", "key-b"])
        );
        assert_eq!(v.pointer("/passwd/users").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn ignition_v3_file_and_unit() {
        let mut ud = UserData::default();
        ud.add_file("/etc/flatcar/update.conf", "SERVER=x y\n", 0o644);
        ud.add_systemd_unit("a.service", "[Unit]\n", true);
        let UserData::Ignition(v) = ud else {
            panic!("shape changed")
        };
        let file = v.pointer("/storage/files/0").unwrap();
        assert_eq!(file["path"], "/etc/flatcar/update.conf");
        assert_eq!(file["mode"], 0o644);
        assert_eq!(file["overwrite"], true);
        assert_eq!(file["contents"]["source"], "data:,SERVER%3Dx%20y%0A");
        let unit = v.pointer("/systemd/units/0").unwrap();
        assert_eq!(unit["enabled"], true);
    }

    #[test]
    fn ignition_v2_uses_v2_field_names() {
        let mut ud = UserData::parse(r#"{"ignition":{"version":"2.3.0"}}"#).unwrap();
        ud.add_file("/etc/x", "x", 0o600);
        ud.add_systemd_unit("a.service", "", true);
        let UserData::Ignition(v) = ud else {
            panic!("shape changed")
        };
        assert_eq!(v.pointer("/storage/files/0/filesystem").unwrap(), "root");
        assert_eq!(v.pointer("/systemd/units/0/enable").unwrap(), true);
    }

    #[test]
    fn cloud_config_merges_and_renders_header() {
        let mut ud = UserData::parse("#cloud-config\nhostname: box\n").unwrap();
        ud.add_ssh_keys("core", &["ssh-ed25519 AAAA".to_string()]);
        ud.add_file("/etc/motd", "hi", 0o644);
        ud.add_systemd_unit("a.service", "[Unit]", true);
        let rendered = ud.render().unwrap();
        let text = String::from_utf8(rendered.bytes).unwrap();
        assert!(text.starts_with("#cloud-config\n"));
        assert!(text.contains("ssh-ed25519 AAAA"));
        assert!(text.contains("/etc/motd"));
        assert!(text.contains("a.service"));
        assert!(text.contains("hostname: box"));
    }

    #[test]
    fn script_passes_through_unchanged() {
        let script = "#!/bin/sh\ntrue\n";
        let mut ud = UserData::parse(script).unwrap();
        ud.add_ssh_keys("core", &["k".to_string()]);
        let rendered = ud.render().unwrap();
        assert_eq!(rendered.bytes, script.as_bytes());
        assert_eq!(rendered.transport, PayloadTransport::ConfigDrive);
    }
}
