//! Typed parsing of every externally-supplied value. Validators sit at the
//! HTTP edge: handlers call them on raw query/form strings and pass only
//! the parsed results further down.

mod auth;
mod basic;
mod hid;
mod kvm;
mod os;
mod switch;

pub use auth::{valid_auth_token, valid_expire, valid_passwd, valid_user};
pub use basic::{valid_bool, valid_float, valid_int, valid_stripped_string_not_empty, valid_string_in_list};
pub use hid::{
    valid_hid_key, valid_hid_keyboard_output, valid_hid_mouse_button, valid_hid_mouse_delta,
    valid_hid_mouse_move, valid_hid_mouse_output, MouseButton,
};
pub use kvm::{
    valid_atx_button, valid_atx_power_action, valid_info_fields, valid_log_seek, valid_msd_image_name,
    valid_url, AtxButton, AtxPowerAction,
};
pub use os::valid_printable_filename;
pub use switch::{
    valid_switch_atx_click_delay, valid_switch_color, valid_switch_edid_data, valid_switch_edid_id,
    valid_switch_port_name,
};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidatorError(pub String);

pub type Result<T> = std::result::Result<T, ValidatorError>;

pub(crate) fn raise<T>(arg: &str, name: &str) -> Result<T> {
    Err(ValidatorError(format!(
        "The argument {arg:?} is not a valid {name}"
    )))
}

pub(crate) fn raise_hidden<T>(name: &str) -> Result<T> {
    Err(ValidatorError(format!("The argument is not a valid {name}")))
}

impl From<ValidatorError> for kvmd_core::ApiError {
    fn from(err: ValidatorError) -> Self {
        kvmd_core::ApiError::Validator(err.0)
    }
}
