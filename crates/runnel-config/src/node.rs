// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// First positional integer of a node, bounded to `T`.
pub(crate) fn get_first_int_arg<T: TryFrom<i128>>(node: &KdlNode) -> ConfigResult<Option<T>> {
    let Some(value) = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
    else {
        return Ok(None);
    };
    to_bounded(node.name().value(), value).map(Some)
}

pub(crate) fn get_int_prop<T: TryFrom<i128>>(node: &KdlNode, name: &str) -> ConfigResult<Option<T>> {
    match node.get(name).and_then(|v| v.as_integer()) {
        Some(value) => to_bounded(name, value).map(Some),
        None => Ok(None),
    }
}

fn to_bounded<T: TryFrom<i128>>(field: &str, value: i128) -> ConfigResult<T> {
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}
