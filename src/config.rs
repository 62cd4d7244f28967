//! Daemon configuration. The YAML tree of the wider ecosystem is out of
//! scope here; everything is typed defaults plus a handful of CLI
//! overrides for the paths that differ between boards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use kvmd_hid::FrontConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HidBackendKind {
    Otg,
    McuSerial,
    McuSpi,
    Bt,
    Ch9329,
}

/// The main KVM-over-IP daemon.
#[derive(Parser)]
#[command(name = "kvmd", version)]
pub struct Args {
    /// Unix socket to listen on.
    #[arg(long, default_value = "/run/kvmd/kvmd.sock")]
    pub unix: PathBuf,

    /// chmod bits for the socket file (octal).
    #[arg(long, default_value = "660")]
    pub unix_mode: String,

    /// HID backend to drive.
    #[arg(long, value_enum, default_value_t = HidBackendKind::Otg)]
    pub hid: HidBackendKind,

    /// HID device or tty path (meaning depends on the backend).
    #[arg(long)]
    pub hid_device: Option<PathBuf>,

    /// fstab to scan for the X-kvmd tags.
    #[arg(long, default_value = "/etc/fstab")]
    pub fstab: PathBuf,

    /// Explicit MSD storage root (overrides the fstab lookup).
    #[arg(long)]
    pub msd_storage: Option<PathBuf>,

    /// USB gadget configfs path.
    #[arg(long, default_value = "/sys/kernel/config/usb_gadget/kvmd")]
    pub gadget: PathBuf,

    /// UDC state file used for the plugged/unplugged heuristic.
    #[arg(long, default_value = "/sys/class/udc/fe980000.usb/state")]
    pub udc_state: PathBuf,

    /// Switch serial device; empty disables the switch subsystem.
    #[arg(long)]
    pub switch_device: Option<PathBuf>,

    /// PST daemon socket; empty disables persistence.
    #[arg(long)]
    pub pst_unix: Option<PathBuf>,

    /// htpasswd file for the internal auth backend.
    #[arg(long, default_value = "/etc/kvmd/htpasswd")]
    pub htpasswd: PathBuf,

    /// Disable authentication entirely (development only).
    #[arg(long)]
    pub auth_disabled: bool,

    /// Streamer command; empty disables the controller.
    #[arg(long = "streamer-cmd", num_args = 0..)]
    pub streamer_cmd: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KvmdConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub hid: HidSection,
    pub msd: MsdSection,
    pub switch: Option<SwitchSection>,
    pub atx: AtxSection,
    pub gpio: GpioSection,
    pub streamer: StreamerSection,
    pub info: InfoSection,
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    pub unix_path: PathBuf,
    pub unix_mode: u32,
    pub heartbeat: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthSection {
    pub enabled: bool,
    pub htpasswd_path: PathBuf,
    /// Optional external checker consulted for everyone outside
    /// `force_internal_users`.
    pub external: Option<ExternalAuth>,
    pub force_internal_users: Vec<String>,
    pub unix_uid_map: HashMap<u32, String>,
}

#[derive(Debug, Clone)]
pub enum ExternalAuth {
    Ldap(kvmd_auth::LdapConfig),
    Radius(kvmd_auth::RadiusConfig),
    Http(kvmd_auth::HttpAuthConfig),
}

#[derive(Debug, Clone)]
pub struct HidSection {
    pub kind: HidBackendKind,
    pub front: FrontConfig,
    pub otg: kvmd_hid::otg::OtgConfig,
    pub mcu: kvmd_hid::mcu::McuConfig,
    pub mcu_serial: kvmd_hid::mcu::SerialPhyConfig,
    pub mcu_spi: kvmd_hid::mcu::SpiPhyConfig,
    pub bt: kvmd_hid::bt::BtConfig,
    pub ch9329: kvmd_hid::ch9329::ChipConfig,
}

#[derive(Debug, Clone)]
pub struct MsdSection {
    pub config: kvmd_msd::MsdConfig,
}

#[derive(Debug, Clone)]
pub struct SwitchSection {
    pub config: kvmd_switch::SwitchConfig,
    pub pst_unix: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AtxSection {
    pub config: kvmd_gpio::AtxConfig,
}

#[derive(Debug, Clone)]
pub struct GpioSection {
    pub device_path: PathBuf,
    pub channels: Vec<kvmd_gpio::ChannelConfig>,
}

#[derive(Debug, Clone)]
pub struct StreamerSection {
    pub cmd: Vec<String>,
    pub unix_path: PathBuf,
    pub shutdown_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct InfoSection {
    pub fields: Vec<&'static str>,
}

impl KvmdConfig {
    pub fn from_args(args: &Args) -> Result<Self, String> {
        let unix_mode =
            u32::from_str_radix(&args.unix_mode, 8).map_err(|_| "bad socket mode".to_owned())?;

        let msd_root = match &args.msd_storage {
            Some(root) => root.clone(),
            None => kvmd_core::fstab::find_msd(&args.fstab)
                .map(|part| part.root_path)
                .unwrap_or_else(|| PathBuf::from("/var/lib/kvmd/msd")),
        };

        let mut hid = HidSection {
            kind: args.hid,
            front: FrontConfig::default(),
            otg: kvmd_hid::otg::OtgConfig {
                udc_state_path: args.udc_state.clone(),
                keyboard: kvmd_hid::otg::EndpointConfig {
                    device_path: PathBuf::from("/dev/kvmd-hid-keyboard"),
                    ..Default::default()
                },
                mouse: kvmd_hid::otg::EndpointConfig {
                    device_path: PathBuf::from("/dev/kvmd-hid-mouse"),
                    ..Default::default()
                },
                mouse_absolute: true,
                mouse_win98_fix: false,
                mouse_horizontal_wheel: true,
                mouse_alt: None,
                mouse_alt_horizontal_wheel: true,
            },
            mcu: kvmd_hid::mcu::McuConfig::default(),
            mcu_serial: kvmd_hid::mcu::SerialPhyConfig::default(),
            mcu_spi: kvmd_hid::mcu::SpiPhyConfig::default(),
            bt: kvmd_hid::bt::BtConfig::default(),
            ch9329: kvmd_hid::ch9329::ChipConfig::default(),
        };
        if let Some(device) = &args.hid_device {
            hid.mcu_serial.device_path = device.clone();
            hid.ch9329.device_path = device.clone();
            hid.otg.keyboard.device_path = device.clone();
        }

        Ok(Self {
            server: ServerSection {
                unix_path: args.unix.clone(),
                unix_mode,
                heartbeat: Duration::from_secs(15),
            },
            auth: AuthSection {
                enabled: !args.auth_disabled,
                htpasswd_path: args.htpasswd.clone(),
                external: None,
                force_internal_users: vec!["admin".to_owned()],
                unix_uid_map: HashMap::new(),
            },
            hid,
            msd: MsdSection {
                config: kvmd_msd::MsdConfig {
                    storage_root: msd_root,
                    gadget_path: args.gadget.clone(),
                    remount_cmd: vec![
                        "/usr/bin/sudo".to_owned(),
                        "--non-interactive".to_owned(),
                        "/usr/bin/kvmd-helper-otgmsd-remount".to_owned(),
                        "{mode}".to_owned(),
                    ],
                    ..Default::default()
                },
            },
            switch: args.switch_device.as_ref().map(|device| SwitchSection {
                config: kvmd_switch::SwitchConfig {
                    device_path: device.clone(),
                    ..Default::default()
                },
                pst_unix: args.pst_unix.clone(),
            }),
            atx: AtxSection {
                config: kvmd_gpio::AtxConfig::default(),
            },
            gpio: GpioSection {
                device_path: PathBuf::from("/dev/gpiochip0"),
                channels: Vec::new(),
            },
            streamer: StreamerSection {
                cmd: args.streamer_cmd.clone(),
                unix_path: PathBuf::from("/run/kvmd/ustreamer.sock"),
                shutdown_delay: Duration::from_secs(10),
            },
            info: InfoSection {
                fields: vec!["auth", "kvm", "system"],
            },
        })
    }
}
