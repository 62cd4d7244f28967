//! Persistence of the reconciled entities as JSON key-value files inside
//! a `__switch__` subdir of the persistent-state store. Writes only
//! happen when the rendered payload actually changed, so the 5-second
//! quiescence debounce upstream never causes pointless flash wear.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::types::{
    default_atx_cp_delays, default_atx_cpl_delays, default_atx_cr_delays, default_port_names,
    AtxClickPowerDelays, AtxClickPowerLongDelays, AtxClickResetDelays, Color, Colors, Edid, Edids,
    PortNames, DEFAULT_EDID_ID,
};
use crate::SwitchError;

pub const SUBDIR: &str = "__switch__";

const F_EDIDS_ALL: &str = "edids_all.json";
const F_EDIDS_PORT: &str = "edids_port.json";
const F_COLORS: &str = "colors.json";
const F_PORT_NAMES: &str = "port_names.json";
const F_ATX_CP_DELAYS: &str = "atx_click_power_delays.json";
const F_ATX_CPL_DELAYS: &str = "atx_click_power_long_delays.json";
const F_ATX_CR_DELAYS: &str = "atx_click_reset_delays.json";

/// Where the entities live. The production impl talks to the PST daemon;
/// tests and storage-less setups use a plain directory or nothing.
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    /// Directory for reads, `None` when persistence is off.
    async fn readable(&self) -> Option<PathBuf>;

    /// Directory for writes plus a guard keeping it writable; `None` when
    /// persistence is off or currently unavailable.
    async fn writable(&self) -> Option<(PathBuf, Box<dyn std::any::Any + Send>)>;
}

/// Persistence disabled: reads yield defaults, writes vanish.
pub struct NullPersistentStorage;

#[async_trait]
impl PersistentStorage for NullPersistentStorage {
    async fn readable(&self) -> Option<PathBuf> {
        None
    }

    async fn writable(&self) -> Option<(PathBuf, Box<dyn std::any::Any + Send>)> {
        None
    }
}

/// A writable plain directory (used by tests and simple deployments).
pub struct DirPersistentStorage(pub PathBuf);

#[async_trait]
impl PersistentStorage for DirPersistentStorage {
    async fn readable(&self) -> Option<PathBuf> {
        Some(self.0.clone())
    }

    async fn writable(&self) -> Option<(PathBuf, Box<dyn std::any::Any + Send>)> {
        Some((self.0.clone(), Box::new(())))
    }
}

pub struct StorageContext<'a> {
    path: &'a Path,
}

impl<'a> StorageContext<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }

    // ===== Writers.

    pub async fn write_edids(&self, edids: &Edids) -> Result<(), SwitchError> {
        let all: BTreeMap<String, Value> = edids
            .all
            .iter()
            .filter(|(id, _)| id.as_str() != DEFAULT_EDID_ID)
            .map(|(id, edid)| {
                (
                    id.to_lowercase(),
                    json!({"name": edid.name, "data": edid.as_text()}),
                )
            })
            .collect();
        self.write_json(F_EDIDS_ALL, &json!(all)).await?;
        let ports: BTreeMap<String, Value> = edids
            .port
            .iter()
            .map(|(port, id)| (port.to_string(), json!(id)))
            .collect();
        self.write_json(F_EDIDS_PORT, &json!(ports)).await
    }

    pub async fn write_colors(&self, colors: &Colors) -> Result<(), SwitchError> {
        let render = |color: &Color| {
            json!({
                "red": color.red,
                "green": color.green,
                "blue": color.blue,
                "brightness": color.brightness,
                "blink_ms": color.blink_ms,
            })
        };
        self.write_json(
            F_COLORS,
            &json!({
                "inactive": render(&colors.inactive),
                "active": render(&colors.active),
                "flashing": render(&colors.flashing),
                "beacon": render(&colors.beacon),
                "bootloader": render(&colors.bootloader),
            }),
        )
        .await
    }

    pub async fn write_port_names(&self, names: &PortNames) -> Result<(), SwitchError> {
        self.write_kvs(F_PORT_NAMES, &names.kvs).await
    }

    pub async fn write_atx_cp_delays(&self, delays: &AtxClickPowerDelays) -> Result<(), SwitchError> {
        self.write_kvs(F_ATX_CP_DELAYS, &delays.kvs).await
    }

    pub async fn write_atx_cpl_delays(
        &self,
        delays: &AtxClickPowerLongDelays,
    ) -> Result<(), SwitchError> {
        self.write_kvs(F_ATX_CPL_DELAYS, &delays.kvs).await
    }

    pub async fn write_atx_cr_delays(&self, delays: &AtxClickResetDelays) -> Result<(), SwitchError> {
        self.write_kvs(F_ATX_CR_DELAYS, &delays.kvs).await
    }

    async fn write_kvs<T: serde::Serialize>(
        &self,
        name: &str,
        kvs: &BTreeMap<u32, T>,
    ) -> Result<(), SwitchError> {
        let rendered: BTreeMap<String, Value> = kvs
            .iter()
            .map(|(port, value)| (port.to_string(), json!(value)))
            .collect();
        self.write_json(name, &json!(rendered)).await
    }

    async fn write_json(&self, name: &str, value: &Value) -> Result<(), SwitchError> {
        if self.read_json(name).await.as_ref() == Some(value) {
            return Ok(());
        }
        let path = self.path.join(name);
        info!(file = name, "writing switch entity");
        tokio::fs::create_dir_all(self.path)
            .await
            .map_err(|err| SwitchError::Storage(format!("can't create storage dir: {err}")))?;
        tokio::fs::write(&path, serde_json::to_vec(value).expect("json render"))
            .await
            .map_err(|err| SwitchError::Storage(format!("can't write {name}: {err}")))
    }

    // ===== Readers. A missing file is the default entity.

    pub async fn read_edids(&self) -> Result<Edids, SwitchError> {
        let mut edids = Edids::default();
        if let Some(all) = self.read_json(F_EDIDS_ALL).await.as_ref().and_then(Value::as_object) {
            for (id, entry) in all {
                let name = entry.get("name").and_then(Value::as_str).unwrap_or("unnamed");
                let data = entry.get("data").and_then(Value::as_str).unwrap_or_default();
                if let Ok(edid) = Edid::from_hex(name, data) {
                    edids.all.insert(id.to_lowercase(), edid);
                }
            }
        }
        if let Some(ports) = self.read_json(F_EDIDS_PORT).await.as_ref().and_then(Value::as_object) {
            for (port, id) in ports {
                if let (Ok(port), Some(id)) = (port.parse::<u32>(), id.as_str()) {
                    if edids.all.contains_key(id) {
                        edids.port.insert(port, id.to_owned());
                    }
                }
            }
        }
        Ok(edids)
    }

    pub async fn read_colors(&self) -> Result<Colors, SwitchError> {
        let Some(raw) = self.read_json(F_COLORS).await else {
            return Ok(Colors::default());
        };
        let parse = |name: &str, fallback: Color| -> Color {
            raw.get(name)
                .and_then(|entry| {
                    Some(Color::new(
                        entry.get("red")?.as_u64()? as u8,
                        entry.get("green")?.as_u64()? as u8,
                        entry.get("blue")?.as_u64()? as u8,
                        entry.get("brightness")?.as_u64()? as u8,
                        entry.get("blink_ms")?.as_u64()? as u16,
                    ))
                })
                .unwrap_or(fallback)
        };
        let defaults = Colors::default();
        Ok(Colors::new(
            parse("inactive", defaults.inactive),
            parse("active", defaults.active),
            parse("flashing", defaults.flashing),
            parse("beacon", defaults.beacon),
            parse("bootloader", defaults.bootloader),
        ))
    }

    pub async fn read_port_names(&self) -> Result<PortNames, SwitchError> {
        let mut names = default_port_names();
        if let Some(raw) = self.read_json(F_PORT_NAMES).await.as_ref().and_then(Value::as_object) {
            for (port, value) in raw {
                if let (Ok(port), Some(value)) = (port.parse::<u32>(), value.as_str()) {
                    names.set(port, Some(value.to_owned()));
                }
            }
        }
        Ok(names)
    }

    pub async fn read_atx_cp_delays(&self) -> Result<AtxClickPowerDelays, SwitchError> {
        self.read_delays(F_ATX_CP_DELAYS, default_atx_cp_delays()).await
    }

    pub async fn read_atx_cpl_delays(&self) -> Result<AtxClickPowerLongDelays, SwitchError> {
        self.read_delays(F_ATX_CPL_DELAYS, default_atx_cpl_delays()).await
    }

    pub async fn read_atx_cr_delays(&self) -> Result<AtxClickResetDelays, SwitchError> {
        self.read_delays(F_ATX_CR_DELAYS, default_atx_cr_delays()).await
    }

    async fn read_delays(
        &self,
        name: &str,
        mut delays: AtxClickPowerDelays,
    ) -> Result<AtxClickPowerDelays, SwitchError> {
        if let Some(raw) = self.read_json(name).await.as_ref().and_then(Value::as_object) {
            for (port, value) in raw {
                if let (Ok(port), Some(value)) = (port.parse::<u32>(), value.as_f64()) {
                    delays.set(port, Some(value));
                }
            }
        }
        Ok(delays)
    }

    async fn read_json(&self, name: &str) -> Option<Value> {
        let raw = tokio::fs::read(self.path.join(name)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entities_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::new(dir.path());

        let mut edids = Edids::default();
        let id = edids.add(Edid::from_hex("hd", &"00FFFFFFFFFFFF00".repeat(16)).unwrap());
        edids.assign(2, &id).unwrap();
        ctx.write_edids(&edids).await.unwrap();

        let colors = Colors::default().with_role("active", Some(Color::new(9, 9, 9, 9, 9)));
        ctx.write_colors(&colors).await.unwrap();

        let mut names = default_port_names();
        names.set(1, Some("build box".to_owned()));
        ctx.write_port_names(&names).await.unwrap();

        let mut delays = default_atx_cp_delays();
        delays.set(0, Some(1.5));
        ctx.write_atx_cp_delays(&delays).await.unwrap();

        let edids_back = ctx.read_edids().await.unwrap();
        assert!(edids_back.has(&id));
        assert_eq!(edids_back.id_for_port(2), id);
        assert_eq!(ctx.read_colors().await.unwrap(), colors);
        assert_eq!(ctx.read_port_names().await.unwrap().get(1), "build box");
        assert_eq!(ctx.read_atx_cp_delays().await.unwrap().get(0), 1.5);
    }

    #[tokio::test]
    async fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::new(dir.path());
        assert_eq!(ctx.read_colors().await.unwrap(), Colors::default());
        let edids = ctx.read_edids().await.unwrap();
        assert!(edids.has(DEFAULT_EDID_ID));
        assert_eq!(edids.all.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_payload_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::new(dir.path());
        let colors = Colors::default();
        ctx.write_colors(&colors).await.unwrap();
        let mtime1 = std::fs::metadata(dir.path().join(F_COLORS)).unwrap().modified().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ctx.write_colors(&colors).await.unwrap();
        let mtime2 = std::fs::metadata(dir.path().join(F_COLORS)).unwrap().modified().unwrap();
        assert_eq!(mtime1, mtime2);
    }
}
