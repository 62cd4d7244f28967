use crate::{raise, Result, ValidatorError};

const TRUE_ARGS: [&str; 3] = ["1", "true", "yes"];
const FALSE_ARGS: [&str; 3] = ["0", "false", "no"];

pub fn valid_bool(arg: &str) -> Result<bool> {
    let lowered = arg.trim().to_ascii_lowercase();
    if TRUE_ARGS.contains(&lowered.as_str()) {
        Ok(true)
    } else if FALSE_ARGS.contains(&lowered.as_str()) {
        Ok(false)
    } else {
        raise(arg, "bool (1/true/yes or 0/false/no)")
    }
}

pub fn valid_int(arg: &str, min: Option<i64>, max: Option<i64>, name: &str) -> Result<i64> {
    let value: i64 = match arg.trim().parse() {
        Ok(value) => value,
        Err(_) => return raise(arg, name),
    };
    check_range(value, min, max, name)
}

pub fn valid_float(arg: &str, min: Option<f64>, max: Option<f64>, name: &str) -> Result<f64> {
    let value: f64 = match arg.trim().parse() {
        Ok(value) => value,
        Err(_) => return raise(arg, name),
    };
    if !value.is_finite() {
        return raise(arg, name);
    }
    if let Some(min) = min {
        if value < min {
            return Err(ValidatorError(format!(
                "The argument {value:?} must be a {name} greater or equal than {min}"
            )));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(ValidatorError(format!(
                "The argument {value:?} must be a {name} lesser or equal than {max}"
            )));
        }
    }
    Ok(value)
}

fn check_range(value: i64, min: Option<i64>, max: Option<i64>, name: &str) -> Result<i64> {
    if let Some(min) = min {
        if value < min {
            return Err(ValidatorError(format!(
                "The argument {value:?} must be a {name} greater or equal than {min}"
            )));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(ValidatorError(format!(
                "The argument {value:?} must be a {name} lesser or equal than {max}"
            )));
        }
    }
    Ok(value)
}

pub fn valid_stripped_string_not_empty(arg: &str, name: &str) -> Result<String> {
    let stripped = arg.trim();
    if stripped.is_empty() {
        return raise(arg, name);
    }
    Ok(stripped.to_owned())
}

pub fn valid_string_in_list(arg: &str, name: &str, variants: &[&str]) -> Result<String> {
    let lowered = arg.trim().to_ascii_lowercase();
    if variants.contains(&lowered.as_str()) {
        Ok(lowered)
    } else {
        raise(arg, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bools() {
        for arg in ["1", "true", "TRUE", "yes", " yes "] {
            assert_eq!(valid_bool(arg), Ok(true), "{arg:?}");
        }
        for arg in ["0", "false", "No"] {
            assert_eq!(valid_bool(arg), Ok(false), "{arg:?}");
        }
        for arg in ["", "x", "2", "da"] {
            assert!(valid_bool(arg).is_err(), "{arg:?}");
        }
    }

    #[test]
    fn ints_respect_bounds() {
        assert_eq!(valid_int("5", Some(1), None, "int"), Ok(5));
        assert!(valid_int("0", Some(1), None, "int").is_err());
        assert!(valid_int("11", None, Some(10), "int").is_err());
        assert!(valid_int("5x", None, None, "int").is_err());
    }

    #[test]
    fn floats_reject_nan_and_inf() {
        assert_eq!(valid_float("0.5", Some(0.1), None, "delay"), Ok(0.5));
        assert!(valid_float("NaN", None, None, "delay").is_err());
        assert!(valid_float("inf", None, None, "delay").is_err());
    }

    #[test]
    fn string_lists_lowercase() {
        assert_eq!(
            valid_string_in_list("ON", "action", &["on", "off"]),
            Ok("on".to_owned())
        );
        assert!(valid_string_in_list("sideways", "action", &["on", "off"]).is_err());
    }
}
