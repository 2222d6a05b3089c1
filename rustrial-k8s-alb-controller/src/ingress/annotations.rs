use std::str::FromStr;

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use rustrial_k8s_alb_controller_apis::annotations::{self, LEGACY_PREFIX, PREFIX};

use super::ingress_id;
use crate::errors::ControllerError;

pub(crate) const DEFAULT_GROUP_ORDER: i64 = 10;
const MIN_GROUP_ORDER: i64 = 1;
const MAX_GROUP_ORDER: i64 = 1000;

fn invalid(ingress: &Ingress, key: &str, message: String) -> ControllerError {
    ControllerError::InvalidAnnotation {
        object: ingress_id(ingress),
        key: key.to_string(),
        message,
    }
}

/// Trimmed, non-empty annotation value.
pub(crate) fn get<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .annotations()
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse<T>(ingress: &Ingress, key: &str) -> Result<Option<T>, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(ingress, key) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(ingress, key, format!("{}: {}", v, e))),
        None => Ok(None),
    }
}

pub(crate) fn parse_bool(ingress: &Ingress, key: &str) -> Result<Option<bool>, ControllerError> {
    match get(ingress, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "true" => Ok(Some(true)),
        Some(v) if v == "false" => Ok(Some(false)),
        Some(v) => Err(invalid(ingress, key, format!("{} is not a boolean", v))),
        None => Ok(None),
    }
}

/// Order of the Ingress within its group and whether it was set explicitly.
pub(crate) fn group_order(ingress: &Ingress) -> Result<(i64, bool), ControllerError> {
    match parse::<i64>(ingress, annotations::GROUP_ORDER)? {
        Some(order) if (MIN_GROUP_ORDER..=MAX_GROUP_ORDER).contains(&order) => Ok((order, true)),
        Some(order) => Err(invalid(
            ingress,
            annotations::GROUP_ORDER,
            format!(
                "{} is outside of [{}, {}]",
                order, MIN_GROUP_ORDER, MAX_GROUP_ORDER
            ),
        )),
        None => Ok((DEFAULT_GROUP_ORDER, false)),
    }
}

/// Canary annotations are accepted with the controller's and the legacy prefix,
/// the controller's prefix wins.
fn canary_key(ingress: &Ingress, suffix: &str) -> Option<String> {
    [PREFIX, LEGACY_PREFIX]
        .iter()
        .map(|p| format!("{}/{}", p, suffix))
        .find(|k| get(ingress, k).is_some())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Canary {
    /// Traffic percentage in [0, 100].
    pub weight: u32,
    pub header: Option<String>,
    pub header_value: Option<String>,
    pub cookie: Option<String>,
}

impl Canary {
    pub fn has_match_conditions(&self) -> bool {
        self.header.is_some() || self.cookie.is_some()
    }
}

/// Canary settings, `None` unless the Ingress is flagged as canary.
pub(crate) fn canary(ingress: &Ingress) -> Result<Option<Canary>, ControllerError> {
    let flag = match canary_key(ingress, annotations::CANARY) {
        Some(key) => parse_bool(ingress, &key)?.unwrap_or(false),
        None => false,
    };
    if !flag {
        return Ok(None);
    }
    let weight = match canary_key(ingress, annotations::CANARY_WEIGHT) {
        Some(key) => {
            let weight = parse::<u32>(ingress, &key)?.unwrap_or(0);
            if weight > 100 {
                return Err(invalid(
                    ingress,
                    &key,
                    format!("{} is outside of [0, 100]", weight),
                ));
            }
            weight
        }
        None => 0,
    };
    let value = |suffix: &str| {
        canary_key(ingress, suffix)
            .and_then(|key| get(ingress, &key))
            .map(|v| v.to_string())
    };
    Ok(Some(Canary {
        weight,
        header: value(annotations::CANARY_BY_HEADER),
        header_value: value(annotations::CANARY_BY_HEADER_VALUE),
        cookie: value(annotations::CANARY_BY_COOKIE),
    }))
}
