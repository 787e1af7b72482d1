use std::{collections::HashSet, ops::RangeInclusive};

use crate::{error::ScanError, scan::ScanType};

/// Ports scanned when a protocol is named without an explicit list.
pub const DEFAULT_PORTS: RangeInclusive<u16> = 1..=1000;

/// Ports requested per protocol. `None` skips that protocol's scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortSelection {
    pub tcp: Option<HashSet<u16>>,
    pub udp: Option<HashSet<u16>>,
}

impl PortSelection {
    /// Parses specs such as `tcp`, `udp/53` or `tcp/22,80,8000-8100`.
    /// Without any spec both protocols get the default ports.
    pub fn parse<'a, I>(specs: I) -> Result<Self, ScanError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut selection = PortSelection::default();
        let mut empty = true;

        for spec in specs {
            empty = false;

            let (kind, ports) = parse_spec(spec)?;
            let slot = match kind {
                ScanType::Syn => &mut selection.tcp,
                ScanType::Udp => &mut selection.udp,
            };
            slot.get_or_insert_with(HashSet::new).extend(ports);
        }

        if empty {
            selection.tcp = Some(DEFAULT_PORTS.collect());
            selection.udp = Some(DEFAULT_PORTS.collect());
        }

        Ok(selection)
    }
}

fn parse_spec(spec: &str) -> Result<(ScanType, HashSet<u16>), ScanError> {
    let invalid = || ScanError::InvalidPort(String::from(spec));

    let (proto, list) = match spec.split_once('/') {
        Some((proto, list)) => (proto, Some(list)),
        None => (spec, None),
    };

    let kind = match proto {
        "tcp" => ScanType::Syn,
        "udp" => ScanType::Udp,
        _ => return Err(invalid()),
    };

    let Some(list) = list else {
        return Ok((kind, DEFAULT_PORTS.collect()));
    };

    let mut ports = HashSet::new();
    for item in list.split(',') {
        let range = match item.split_once('-') {
            Some((first, last)) => parse_port(first)?..=parse_port(last)?,
            None => {
                let port = parse_port(item)?;
                port..=port
            }
        };

        if range.is_empty() {
            return Err(invalid());
        }
        ports.extend(range);
    }

    Ok((kind, ports))
}

fn parse_port(raw: &str) -> Result<u16, ScanError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ScanError::InvalidPort(String::from(raw))),
    }
}
