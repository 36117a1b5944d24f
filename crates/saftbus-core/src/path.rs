//! Object addressing rules.

use crate::error::BusError;

/// Reserved pseudo-interface carrying property get/set requests.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Checks that `path` is a hierarchical, slash-separated object path.
///
/// Valid paths start with `/`, contain no empty segments and no trailing
/// slash (except the root path `/` itself). Segments may contain ASCII
/// letters, digits and `_`.
pub fn validate_object_path(path: &str) -> Result<(), BusError> {
    if path == "/" {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(BusError::invalid_args(format!(
            "object path must start with '/': {path:?}"
        )));
    };
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(BusError::invalid_args(format!(
                "object path has an empty segment: {path:?}"
            )));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BusError::invalid_args(format!(
                "object path segment {segment:?} has invalid characters"
            )));
        }
    }
    Ok(())
}

/// Checks that `name` is a dotted interface name with at least two elements.
pub fn validate_interface_name(name: &str) -> Result<(), BusError> {
    let mut elements = 0usize;
    for element in name.split('.') {
        let starts_ok = element
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let rest_ok = element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !starts_ok || !rest_ok {
            return Err(BusError::invalid_args(format!(
                "invalid interface name: {name:?}"
            )));
        }
        elements += 1;
    }
    if elements < 2 {
        return Err(BusError::invalid_args(format!(
            "interface name needs at least two elements: {name:?}"
        )));
    }
    if name == PROPERTIES_INTERFACE {
        return Err(BusError::invalid_args(format!(
            "{PROPERTIES_INTERFACE} is reserved"
        )));
    }
    Ok(())
}
