//! Console introspection tables

use std::fmt::Write;

use crate::registry::ChannelRegistry;

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

/// `show channeltypes`: one row per registered technology
pub fn show_channeltypes(registry: &ChannelRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10.10}  {:<40.40} {:<12.12} {:<12.12} {:<12.12}",
        "Type", "Description", "Devicestate", "Indications", "Transfer"
    );
    let _ = writeln!(
        out,
        "{:<10.10}  {:<40.40} {:<12.12} {:<12.12} {:<12.12}",
        "----------", "-----------", "-----------", "-----------", "--------"
    );
    let types = registry.channel_types();
    for tech in &types {
        let features = tech.features();
        let _ = writeln!(
            out,
            "{:<10.10}  {:<40.40} {:<12.12} {:<12.12} {:<12.12}",
            tech.type_name(),
            tech.description(),
            yes_no(features.devicestate),
            yes_no(features.indications),
            yes_no(features.transfer)
        );
    }
    let _ = writeln!(out, "----------\n{} channel drivers loaded.", types.len());
    out
}

/// `show channels`: one row per live channel
pub async fn show_channels(registry: &ChannelRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20.20} {:<20.20} {:<7.7} {:<30.30}",
        "Channel", "Location", "State", "Application"
    );
    let chans = registry.channels();
    for chan in &chans {
        let c = chan.lock().await;
        let location = format!("{}@{}:{}", c.exten(), c.context(), c.priority);
        let appl = match (&c.appl, &c.data) {
            (Some(appl), Some(data)) => format!("{}({})", appl, data),
            (Some(appl), None) => format!("{}()", appl),
            _ => "(None)".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<20.20} {:<20.20} {:<7.7} {:<30.30}",
            c.name(),
            location,
            c.state().name(),
            appl
        );
    }
    let _ = writeln!(
        out,
        "{} active channel{}",
        chans.len(),
        if chans.len() == 1 { "" } else { "s" }
    );
    out
}
