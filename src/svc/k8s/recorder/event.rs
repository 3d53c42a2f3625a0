//! # Event module
//!
//! This module provide helpers to build core/v1 events

use std::fmt::Debug;

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, CustomResourceExt, ResourceExt};

use crate::svc::k8s::{recorder::Level, resource};

/// returns a new event about the given object
pub fn new<T, U>(obj: &T, level: Level, action: &U, message: &str) -> Event
where
    T: ResourceExt + CustomResourceExt,
    U: ToString + Debug,
{
    let now = Utc::now();
    let action = action.to_string();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(format!(
                "{}-{}-{}",
                obj.name_any(),
                action.to_lowercase(),
                now.timestamp_micros()
            )),
            ..Default::default()
        },
        type_: Some(level.to_string()),
        action: Some(action.to_owned()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        involved_object: resource::object_reference(obj),
        last_timestamp: Some(Time(now)),
        message: Some(message.to_string()),
        reason: Some(action),
        reporting_component: Some(env!("CARGO_PKG_NAME").to_string()),
        reporting_instance: Some(instance()),
        source: Some(source()),
        ..Default::default()
    }
}

fn instance() -> String {
    hostname::get()
        .map(|host| host.to_string_lossy().to_string())
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string())
}

/// returns the source of this operator
pub fn source() -> EventSource {
    EventSource {
        component: Some(env!("CARGO_PKG_NAME").to_string()),
        host: hostname::get()
            .ok()
            .map(|host| host.to_string_lossy().to_string()),
    }
}
