//! Parsing of nmcli terse (`-t`) output.

use super::{ActiveConnection, Profile, ProfileState};

/// nmcli's type name for WiFi profiles.
pub const WIFI_TYPE: &str = "802-11-wireless";

/// Splits one terse line on unescaped `:`, undoing `\:` and `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parses `nmcli -t -f NAME,TYPE,DEVICE,STATE connection show --active`.
pub fn parse_active_connections(stdout: &str) -> Vec<ActiveConnection> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 4 || fields[0].is_empty() {
                return None;
            }
            Some(ActiveConnection {
                name: fields[0].clone(),
                kind: fields[1].clone(),
                device: Some(fields[2].clone()).filter(|d| !d.is_empty() && d != "--"),
                state: ProfileState::parse(&fields[3]),
            })
        })
        .collect()
}

/// Parses `nmcli -t -f NAME,TYPE connection show`.
pub fn parse_profiles(stdout: &str) -> Vec<Profile> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 2 || fields[0].is_empty() {
                return None;
            }
            Some(Profile {
                name: fields[0].clone(),
                kind: fields[1].clone(),
            })
        })
        .collect()
}

/// Finds the SSID on the `yes` line of `nmcli -t -f ACTIVE,SSID device wifi list`.
pub fn parse_active_ssid(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [active, ssid, ..] if active == "yes" && !ssid.is_empty() => Some(ssid.clone()),
            _ => None,
        }
    })
}

/// Takes the first address of a `-g IP4.ADDRESS` value and drops the prefix length.
///
/// Multiple addresses are separated by ` | `.
pub fn parse_ip4_address(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.split('|').next()?.trim();
    let addr = first.split('/').next()?.trim();
    if addr.is_empty() || addr == "--" {
        None
    } else {
        Some(addr.to_string())
    }
}

/// Unescapes a single `-g` value.
pub fn single_value(stdout: &str) -> Option<String> {
    let line = stdout.lines().next()?;
    let value = split_terse(line).join(":");
    let value = value.trim();
    if value.is_empty() || value == "--" {
        None
    } else {
        Some(value.to_string())
    }
}
